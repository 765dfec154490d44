//! The request arena and the completion machinery shared by every stage of a stack.
//!
//! Completing a request is split in two: [`StreamerContext::mark_request_as_completed`] (or
//! [`CompletionSender::mark_completed`] from another thread) only records that a request is
//! done, and [`StreamerContext::finalize_completed_requests`] later runs callbacks and walks
//! up the request tree. Callbacks therefore never run inside the stage or thread that
//! signaled completion, and a long chain of parents completes in a loop rather than through
//! nested calls.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use streamer_error::{StreamerResult, streamer_bail, streamer_panic};

use crate::request::{FileRequest, MAX_NUM_DEPENDENCIES, RequestId, RequestStatus};

/// A notification that a request has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub request: RequestId,
    /// Status applied to the request when the notification is drained.
    pub status: Option<RequestStatus>,
}

/// Thread-safe handle for signaling completions into a [`StreamerContext`].
#[derive(Debug, Clone)]
pub struct CompletionSender(flume::Sender<Completion>);

impl CompletionSender {
    /// Record that `request` finished with `status`.
    ///
    /// The status is applied and the request finalized on the next drain of the context.
    pub fn mark_completed(&self, request: RequestId, status: RequestStatus) {
        self.send(Completion {
            request,
            status: Some(status),
        })
    }

    fn send(&self, completion: Completion) {
        if self.0.send(completion).is_err() {
            log::debug!(
                "dropping completion of {}, context is gone",
                completion.request
            );
        }
    }
}

enum Slot {
    Free,
    Occupied(FileRequest),
    /// Taken out of the arena while its completion callback runs.
    Finalizing,
}

struct Entry {
    generation: u32,
    slot: Slot,
}

#[derive(Default)]
struct Arena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    active: usize,
}

impl Arena {
    fn insert(&mut self, request: FileRequest) -> RequestId {
        self.active += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Slot::Occupied(request);
            return RequestId {
                index,
                generation: entry.generation,
            };
        }

        let index = u32::try_from(self.entries.len())
            .unwrap_or_else(|_| streamer_panic!(InvalidState: "request arena is full"));
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Occupied(request),
        });
        RequestId {
            index,
            generation: 0,
        }
    }

    fn entry_mut(&mut self, id: RequestId) -> Option<&mut Entry> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
    }

    fn get(&self, id: RequestId) -> Option<&FileRequest> {
        match self.entries.get(id.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Occupied(request),
            }) if *generation == id.generation => Some(request),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        match self.entry_mut(id) {
            Some(Entry {
                slot: Slot::Occupied(request),
                ..
            }) => Some(request),
            _ => None,
        }
    }

    /// Take a request out for finalization, leaving its slot reserved.
    fn take(&mut self, id: RequestId) -> Option<FileRequest> {
        let entry = self.entry_mut(id)?;
        match std::mem::replace(&mut entry.slot, Slot::Finalizing) {
            Slot::Occupied(request) => Some(request),
            other => {
                entry.slot = other;
                None
            }
        }
    }

    fn restore(&mut self, id: RequestId, request: FileRequest) {
        if let Some(entry) = self.entry_mut(id) {
            entry.slot = Slot::Occupied(request);
        }
    }

    /// Free the slot of `id` and invalidate the id. Returns the request that occupied it.
    fn release(&mut self, id: RequestId) -> Option<FileRequest> {
        let entry = self.entry_mut(id)?;
        let previous = match std::mem::replace(&mut entry.slot, Slot::Free) {
            Slot::Free => return None,
            Slot::Occupied(request) => Some(request),
            Slot::Finalizing => None,
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.active -= 1;
        previous
    }
}

/// Owns every request of a stack and propagates their completion.
///
/// The context lives on the streamer thread: it is shared between stages through `Rc` and
/// is neither `Send` nor `Sync`. The only way in from another thread is a
/// [`CompletionSender`].
pub struct StreamerContext {
    requests: RefCell<Arena>,
    sender: flume::Sender<Completion>,
    receiver: flume::Receiver<Completion>,
    backlog: RefCell<VecDeque<Completion>>,
    finalizing: Cell<bool>,
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamerContext {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            requests: RefCell::default(),
            sender,
            receiver,
            backlog: RefCell::default(),
            finalizing: Cell::new(false),
        }
    }

    /// Allocate a request that is recycled automatically once it has been finalized.
    ///
    /// Stages use internal requests for the sub-requests they create.
    pub fn get_new_internal_request(&self) -> RequestId {
        self.requests.borrow_mut().insert(FileRequest::new(true))
    }

    /// Allocate a request owned by the caller, who must hand it back with
    /// [`recycle_request`](Self::recycle_request).
    pub fn get_new_external_request(&self) -> RequestId {
        self.requests.borrow_mut().insert(FileRequest::new(false))
    }

    /// Return a request to the arena, invalidating `id`.
    pub fn recycle_request(&self, id: RequestId) -> StreamerResult<()> {
        let mut requests = self.requests.borrow_mut();
        let Some(request) = requests.get(id) else {
            streamer_bail!("request {} is not live and cannot be recycled", id);
        };
        if request.num_dependencies() > 0 {
            streamer_bail!(
                InvalidState: "request {} still has {} pending dependencies",
                id,
                request.num_dependencies()
            );
        }
        let recycled = requests.release(id);
        drop(requests);
        drop(recycled);
        Ok(())
    }

    /// Make `child` a dependency of `parent`.
    ///
    /// The parent will not be finalized before the child is.
    pub fn set_parent(&self, child: RequestId, parent: RequestId) -> StreamerResult<()> {
        if child == parent {
            streamer_bail!("request {} cannot be its own parent", child);
        }

        let mut requests = self.requests.borrow_mut();
        let Some(parent_request) = requests.get(parent) else {
            streamer_bail!("parent request {} is not live", parent);
        };
        if parent_request.finalized {
            streamer_bail!(InvalidState: "parent request {} is already finalized", parent);
        }
        if parent_request.children >= MAX_NUM_DEPENDENCIES {
            streamer_bail!(
                InvalidState: "request {} already has {} children",
                parent,
                MAX_NUM_DEPENDENCIES
            );
        }

        let Some(child_request) = requests.get_mut(child) else {
            streamer_bail!("child request {} is not live", child);
        };
        if let Some(existing) = child_request.parent {
            streamer_bail!(
                InvalidState: "request {} already has parent {}",
                child,
                existing
            );
        }
        child_request.parent = Some(parent);

        if let Some(parent_request) = requests.get_mut(parent) {
            parent_request.children += 1;
        }
        Ok(())
    }

    /// Hold an extra dependency on `id` so that it cannot be finalized.
    pub fn add_dependency(&self, id: RequestId) -> StreamerResult<()> {
        match self.requests.borrow_mut().get_mut(id) {
            Some(request) => {
                request.holds += 1;
                Ok(())
            }
            None => streamer_bail!("request {} is not live", id),
        }
    }

    /// Release a dependency taken with [`add_dependency`](Self::add_dependency).
    ///
    /// Releasing the last dependency marks the request completed.
    pub fn release_dependency(&self, id: RequestId) -> StreamerResult<()> {
        let remaining = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(id) else {
                streamer_bail!("request {} is not live", id);
            };
            if request.holds == 0 {
                streamer_bail!(InvalidState: "request {} has no held dependency", id);
            }
            request.holds -= 1;
            request.num_dependencies()
        };

        if remaining == 0 {
            self.mark_request_as_completed(id);
        }
        Ok(())
    }

    /// Run `f` on the request, returning `None` if `id` is stale.
    ///
    /// `f` must not call back into the context.
    pub fn with_request<R>(&self, id: RequestId, f: impl FnOnce(&FileRequest) -> R) -> Option<R> {
        self.requests.borrow().get(id).map(f)
    }

    /// Run `f` on the request mutably, returning `None` if `id` is stale.
    ///
    /// `f` must not call back into the context.
    pub fn with_request_mut<R>(
        &self,
        id: RequestId,
        f: impl FnOnce(&mut FileRequest) -> R,
    ) -> Option<R> {
        self.requests.borrow_mut().get_mut(id).map(f)
    }

    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.with_request(id, FileRequest::status)
    }

    pub fn parent(&self, id: RequestId) -> Option<RequestId> {
        self.with_request(id, FileRequest::parent).flatten()
    }

    pub fn num_dependencies(&self, id: RequestId) -> Option<usize> {
        self.with_request(id, FileRequest::num_dependencies)
    }

    /// Number of requests allocated from the arena and not yet recycled.
    pub fn num_active_requests(&self) -> usize {
        self.requests.borrow().active
    }

    /// Record that `id` is done. Nothing runs until the next
    /// [`finalize_completed_requests`](Self::finalize_completed_requests).
    pub fn mark_request_as_completed(&self, id: RequestId) {
        self.backlog.borrow_mut().push_back(Completion {
            request: id,
            status: None,
        });
    }

    /// A handle for signaling completions from other threads.
    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender(self.sender.clone())
    }

    pub fn has_pending_completions(&self) -> bool {
        !self.backlog.borrow().is_empty() || !self.receiver.is_empty()
    }

    /// Block until a completion arrives or `timeout` elapses. Returns whether one is pending.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        if self.has_pending_completions() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => {
                self.defer_completion(completion);
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn completion_receiver(&self) -> &flume::Receiver<Completion> {
        &self.receiver
    }

    /// Queue a completion received outside of the context for the next drain.
    pub(crate) fn defer_completion(&self, completion: Completion) {
        self.backlog.borrow_mut().push_back(completion);
    }

    /// Run one drain cycle.
    ///
    /// Every completion recorded before the call is processed: its status is applied, and a
    /// request without outstanding dependencies is finalized. Finalizing detaches the request
    /// from its parent and then runs the completion callback, during which the parent is held
    /// open; the callback may replace the finished child with a new one even when the parent
    /// was at [`MAX_NUM_DEPENDENCIES`]. A failed or canceled request fails its parent, and a
    /// parent left without dependencies is finalized in the same cycle, so children are always
    /// finalized before their parents. Completions recorded by
    /// callbacks wait for the next cycle.
    ///
    /// Internal requests are recycled once finalized. Returns whether any completion was
    /// processed.
    pub fn finalize_completed_requests(&self) -> bool {
        if self.finalizing.replace(true) {
            log::warn!("ignoring re-entrant drain of completed requests");
            return false;
        }

        let mut batch = std::mem::take(&mut *self.backlog.borrow_mut());
        let received = self.receiver.len();
        batch.extend(self.receiver.try_iter().take(received));
        if batch.is_empty() {
            self.finalizing.set(false);
            return false;
        }

        let mut ready = VecDeque::with_capacity(batch.len());
        {
            let mut requests = self.requests.borrow_mut();
            for Completion { request, status } in batch {
                let Some(entry) = requests.get_mut(request) else {
                    log::trace!("ignoring completion of stale request {request}");
                    continue;
                };
                if let Some(status) = status {
                    entry.set_status(status);
                }
                ready.push_back(request);
            }
        }

        let mut finalized = 0usize;
        while let Some(id) = ready.pop_front() {
            let Some(mut request) = self.take_ready(id) else {
                continue;
            };

            request.set_status(RequestStatus::Completed);
            request.finalized = true;
            let parent = request.parent;
            let status = request.status;

            // The request gives up its place among the parent's children before its callback
            // runs, and a hold keeps the parent open while the callback may add new children.
            if let Some(parent_id) = parent {
                match self.requests.borrow_mut().get_mut(parent_id) {
                    Some(parent_request) => {
                        if status.is_failure() {
                            parent_request.set_status(status);
                        }
                        debug_assert!(parent_request.children > 0);
                        parent_request.children = parent_request.children.saturating_sub(1);
                        parent_request.holds += 1;
                    }
                    None => log::warn!("parent {parent_id} of {id} is no longer live"),
                }
            }

            if let Some(callback) = request.callback.take() {
                callback(&request);
            }
            finalized += 1;

            let recycled = {
                let mut requests = self.requests.borrow_mut();
                let recycled = if request.internal {
                    requests.release(id);
                    Some(request)
                } else {
                    requests.restore(id, request);
                    None
                };

                if let Some(parent_id) = parent {
                    if let Some(parent_request) = requests.get_mut(parent_id) {
                        parent_request.holds = parent_request.holds.saturating_sub(1);
                        if parent_request.num_dependencies() == 0 {
                            ready.push_back(parent_id);
                        }
                    }
                }
                recycled
            };
            drop(recycled);
        }

        log::trace!("finalized {finalized} requests");
        self.finalizing.set(false);
        true
    }

    /// Take `id` out of the arena if it is ready to be finalized.
    fn take_ready(&self, id: RequestId) -> Option<FileRequest> {
        let mut requests = self.requests.borrow_mut();
        let request = requests.get(id)?;
        if request.finalized || request.num_dependencies() > 0 {
            return None;
        }
        requests.take(id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use streamer_error::StreamerError;

    use crate::context::StreamerContext;
    use crate::request::{MAX_NUM_DEPENDENCIES, RequestId, RequestStatus};

    fn record(context: &StreamerContext, id: RequestId, log: &Rc<RefCell<Vec<RequestId>>>) {
        let log = log.clone();
        context.with_request_mut(id, move |request| {
            request.set_completion_callback(move |_| log.borrow_mut().push(id))
        });
    }

    #[test]
    fn recycled_ids_go_stale() {
        let context = StreamerContext::new();
        let id = context.get_new_external_request();
        assert_eq!(context.num_active_requests(), 1);
        context.recycle_request(id).unwrap();
        assert_eq!(context.num_active_requests(), 0);

        let reused = context.get_new_external_request();
        assert_eq!(reused.index, id.index);
        assert_ne!(reused, id);
        assert!(context.status(id).is_none());
        assert_eq!(context.status(reused), Some(RequestStatus::Pending));

        let err = context.recycle_request(id).unwrap_err();
        assert!(matches!(err, StreamerError::InvalidArgument(_)));
    }

    #[test]
    fn mark_only_records_intent() {
        let context = StreamerContext::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = context.get_new_external_request();
        record(&context, id, &log);

        context.mark_request_as_completed(id);
        context.mark_request_as_completed(id);
        assert!(log.borrow().is_empty());
        assert!(context.has_pending_completions());

        assert!(context.finalize_completed_requests());
        assert_eq!(*log.borrow(), vec![id]);
        assert_eq!(context.status(id), Some(RequestStatus::Completed));
        assert!(!context.finalize_completed_requests());
    }

    #[test]
    fn children_finalize_before_parent() {
        let context = StreamerContext::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent = context.get_new_external_request();
        let first = context.get_new_internal_request();
        let second = context.get_new_internal_request();
        for id in [parent, first, second] {
            record(&context, id, &log);
        }
        context.set_parent(first, parent).unwrap();
        context.set_parent(second, parent).unwrap();
        assert_eq!(context.num_dependencies(parent), Some(2));
        assert_eq!(context.parent(first), Some(parent));

        // Marking the parent early does nothing while children are outstanding.
        context.mark_request_as_completed(parent);
        context.mark_request_as_completed(second);
        context.finalize_completed_requests();
        assert_eq!(*log.borrow(), vec![second]);
        assert_eq!(context.status(parent), Some(RequestStatus::Pending));

        context.mark_request_as_completed(first);
        context.finalize_completed_requests();
        assert_eq!(*log.borrow(), vec![second, first, parent]);
        assert_eq!(context.status(parent), Some(RequestStatus::Completed));

        // Internal children were recycled, the external parent is kept.
        assert!(context.status(first).is_none());
        assert_eq!(context.num_active_requests(), 1);
        context.recycle_request(parent).unwrap();
    }

    #[test]
    fn deep_chain_completes_in_one_cycle() {
        let context = StreamerContext::new();
        let root = context.get_new_external_request();
        let mut leaf = root;
        for _ in 0..100_000 {
            let child = context.get_new_internal_request();
            context.set_parent(child, leaf).unwrap();
            leaf = child;
        }

        context.mark_request_as_completed(leaf);
        context.finalize_completed_requests();
        assert_eq!(context.status(root), Some(RequestStatus::Completed));
        assert_eq!(context.num_active_requests(), 1);
    }

    #[test]
    fn failure_is_inherited() {
        let context = StreamerContext::new();
        let parent = context.get_new_external_request();
        let ok = context.get_new_internal_request();
        let bad = context.get_new_internal_request();
        context.set_parent(ok, parent).unwrap();
        context.set_parent(bad, parent).unwrap();

        let sender = context.completion_sender();
        sender.mark_completed(bad, RequestStatus::Failed);
        sender.mark_completed(ok, RequestStatus::Completed);
        context.finalize_completed_requests();

        assert_eq!(context.status(parent), Some(RequestStatus::Failed));
    }

    #[test]
    fn marks_from_callbacks_wait_for_next_cycle() {
        let context = Rc::new(StreamerContext::new());
        let first = context.get_new_external_request();
        let second = context.get_new_external_request();

        let ctx = context.clone();
        context.with_request_mut(first, move |request| {
            request.set_completion_callback(move |_| ctx.mark_request_as_completed(second))
        });

        context.mark_request_as_completed(first);
        context.finalize_completed_requests();
        assert_eq!(context.status(first), Some(RequestStatus::Completed));
        assert_eq!(context.status(second), Some(RequestStatus::Pending));

        context.finalize_completed_requests();
        assert_eq!(context.status(second), Some(RequestStatus::Completed));
    }

    #[test]
    fn callback_may_add_children_to_parent() {
        let context = Rc::new(StreamerContext::new());
        let parent = context.get_new_external_request();
        let first = context.get_new_internal_request();
        context.set_parent(first, parent).unwrap();

        let late = Rc::new(RefCell::new(None));
        let (ctx, slot) = (context.clone(), late.clone());
        context.with_request_mut(first, move |request| {
            request.set_completion_callback(move |_| {
                let next = ctx.get_new_internal_request();
                ctx.set_parent(next, parent).unwrap();
                *slot.borrow_mut() = Some(next);
            })
        });

        context.mark_request_as_completed(first);
        context.finalize_completed_requests();
        assert_eq!(context.status(parent), Some(RequestStatus::Pending));

        let next = late.borrow().unwrap();
        context.mark_request_as_completed(next);
        context.finalize_completed_requests();
        assert_eq!(context.status(parent), Some(RequestStatus::Completed));
    }

    #[test]
    fn callback_may_refill_a_full_parent() {
        let context = Rc::new(StreamerContext::new());
        let parent = context.get_new_external_request();
        let children = (0..MAX_NUM_DEPENDENCIES)
            .map(|_| {
                let id = context.get_new_internal_request();
                context.set_parent(id, parent).unwrap();
                id
            })
            .collect::<Vec<_>>();

        let added = Rc::new(RefCell::new(Vec::new()));
        let (ctx, slot) = (context.clone(), added.clone());
        context.with_request_mut(children[0], move |request| {
            request.set_completion_callback(move |_| {
                // One place is free, but the parent still has dependencies.
                assert_eq!(ctx.num_dependencies(parent), Some(MAX_NUM_DEPENDENCIES));
                let next = ctx.get_new_internal_request();
                ctx.set_parent(next, parent).unwrap();
                slot.borrow_mut().push(next);
            })
        });

        context.mark_request_as_completed(children[0]);
        context.finalize_completed_requests();
        assert_eq!(added.borrow().len(), 1);
        assert_eq!(context.num_dependencies(parent), Some(MAX_NUM_DEPENDENCIES));
        assert_eq!(context.status(parent), Some(RequestStatus::Pending));

        for id in children[1..].iter().chain(added.borrow().iter()) {
            context.mark_request_as_completed(*id);
        }
        context.finalize_completed_requests();
        assert_eq!(context.status(parent), Some(RequestStatus::Completed));
        assert_eq!(context.num_dependencies(parent), Some(0));
        assert_eq!(context.num_active_requests(), 1);
    }

    #[test]
    fn held_dependency_blocks_completion() {
        let context = StreamerContext::new();
        let id = context.get_new_external_request();
        context.add_dependency(id).unwrap();

        context.mark_request_as_completed(id);
        context.finalize_completed_requests();
        assert_eq!(context.status(id), Some(RequestStatus::Pending));
        assert!(context.recycle_request(id).is_err());

        context.release_dependency(id).unwrap();
        context.finalize_completed_requests();
        assert_eq!(context.status(id), Some(RequestStatus::Completed));
        assert!(context.release_dependency(id).is_err());
    }

    #[test]
    fn set_parent_errors() {
        let context = StreamerContext::new();
        let parent = context.get_new_external_request();
        let child = context.get_new_internal_request();
        let other = context.get_new_external_request();

        assert!(context.set_parent(parent, parent).is_err());
        context.set_parent(child, parent).unwrap();
        assert!(matches!(
            context.set_parent(child, other),
            Err(StreamerError::InvalidState(_))
        ));

        let full = context.get_new_external_request();
        for _ in 0..MAX_NUM_DEPENDENCIES {
            let id = context.get_new_internal_request();
            context.set_parent(id, full).unwrap();
        }
        let overflow = context.get_new_internal_request();
        assert!(context.set_parent(overflow, full).is_err());
    }

    #[test]
    fn completions_from_other_threads() {
        let context = StreamerContext::new();
        let ids = (0..8)
            .map(|_| context.get_new_external_request())
            .collect::<Vec<_>>();

        let sender = context.completion_sender();
        let worker_ids = ids.clone();
        thread::spawn(move || {
            for id in worker_ids {
                sender.mark_completed(id, RequestStatus::Completed);
            }
        })
        .join()
        .unwrap();

        assert!(context.wait_for_completion(Duration::from_secs(1)));
        context.finalize_completed_requests();
        for id in ids {
            assert_eq!(context.status(id), Some(RequestStatus::Completed));
        }
        assert!(!context.wait_for_completion(Duration::from_millis(1)));
    }
}
