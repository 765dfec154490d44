//! The contract shared by every stage of a streaming stack.
//!
//! Stages form a singly-linked chain: each one holds its successor and forwards the requests
//! it does not fully handle itself. The last stage is the device, which performs the actual
//! I/O. All stages of a chain share one [`StreamerContext`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::context::StreamerContext;
use crate::request::{RequestId, RequestStatus};
use crate::statistics::Statistic;

/// Load summary of a stack, accumulated from the head to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// How many more requests the stack can take on right now.
    pub num_available_slots: usize,
    /// No stage has work queued or in flight.
    pub is_idle: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            num_available_slots: usize::MAX,
            is_idle: true,
        }
    }
}

/// One stage of a streaming stack.
///
/// Stages are shared through `Rc` and only ever used from the streamer thread, so every
/// method takes `&self` and stages keep their mutable state in cells.
pub trait StreamStackEntry {
    fn name(&self) -> &str;

    /// Wire the stage this one forwards to.
    fn set_next(&self, next: Rc<dyn StreamStackEntry>);

    /// Hand the shared context to this stage and, by convention, to its successor.
    fn set_context(&self, context: Rc<StreamerContext>);

    /// Take responsibility for `request`.
    ///
    /// The stage must eventually either forward the request or mark it completed. It must
    /// never drop a request.
    fn queue_request(&self, request: RequestId);

    /// Make progress on queued work. Returns whether anything was done.
    fn execute_requests(&self) -> bool;

    /// Fold this stage's load into `status`, then its successor's.
    fn update_status(&self, status: &mut Status);

    /// Append this stage's statistics, then its successor's.
    fn collect_statistics(&self, statistics: &mut Vec<Statistic>);
}

/// The successor and context of a stage, with the conventional forwarding behavior.
///
/// Stages embed a `StackLink` and delegate to it for everything they do not handle
/// themselves.
pub struct StackLink {
    name: Arc<str>,
    next: RefCell<Option<Rc<dyn StreamStackEntry>>>,
    context: RefCell<Option<Rc<StreamerContext>>>,
}

impl StackLink {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            next: RefCell::new(None),
            context: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn set_next(&self, next: Rc<dyn StreamStackEntry>) {
        *self.next.borrow_mut() = Some(next);
    }

    pub fn next(&self) -> Option<Rc<dyn StreamStackEntry>> {
        self.next.borrow().clone()
    }

    /// Store the context and forward it down the chain.
    pub fn set_context(&self, context: Rc<StreamerContext>) {
        *self.context.borrow_mut() = Some(context.clone());
        if let Some(next) = self.next() {
            next.set_context(context);
        }
    }

    pub fn context(&self) -> Option<Rc<StreamerContext>> {
        self.context.borrow().clone()
    }

    /// Forward `request` to the next stage.
    ///
    /// A terminal stage has nowhere to send it, so the request fails instead of being lost.
    pub fn queue_request(&self, request: RequestId) {
        if let Some(next) = self.next() {
            next.queue_request(request);
            return;
        }

        let Some(context) = self.context() else {
            log::error!(
                "{}: no successor and no context to fail request {request}",
                self.name
            );
            return;
        };
        log::warn!("{}: no successor for request {request}, failing it", self.name);
        context.with_request_mut(request, |r| r.set_status(RequestStatus::Failed));
        context.mark_request_as_completed(request);
    }

    pub fn execute_requests(&self) -> bool {
        self.next().is_some_and(|next| next.execute_requests())
    }

    pub fn update_status(&self, status: &mut Status) {
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        if let Some(next) = self.next() {
            next.collect_statistics(statistics);
        }
    }
}

/// Chain `stages` in order, returning the head of the stack.
pub fn link_stages(stages: Vec<Rc<dyn StreamStackEntry>>) -> Option<Rc<dyn StreamStackEntry>> {
    stages.into_iter().rev().reduce(|next, stage| {
        stage.set_next(next);
        stage
    })
}
