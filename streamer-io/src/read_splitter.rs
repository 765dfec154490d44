//! A stage that turns arbitrary reads into reads the device below can serve.
//!
//! Devices usually constrain reads: a maximum size, a required alignment of the file
//! offset and read size, and a required alignment of the destination address. The
//! [`ReadSplitter`] forwards reads that already satisfy all of these untouched. Any other
//! read is split into sub-reads that each do, parented to the original read so that it
//! completes once all of its parts have.
//!
//! Parts of a read that cannot be made aligned in place are read through a scratch buffer:
//! the sub-read covers the enclosing aligned range, lands in a scratch slot, and on
//! completion the requested window is copied into the caller's buffer. Scratch slots are a
//! bounded resource. A read that needs one while none is free waits in a FIFO until another
//! sub-read releases its slot.
//!
//! The number of sub-reads of one read in flight at a time is capped at
//! [`MAX_NUM_DEPENDENCIES`]. Sub-reads are generated lazily in increasing offset order, and
//! every completion dispatches the next ones.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use streamer_error::{StreamerExpect, StreamerResult, streamer_bail, streamer_err};
use streamer_metrics::{Counter, StreamerMetrics};

use crate::alignment::{align_down, align_up, is_address_aligned, is_aligned};
use crate::buffer::{BufferView, IoBuffer};
use crate::context::StreamerContext;
use crate::request::{
    FileRequest, MAX_NUM_DEPENDENCIES, ReadData, RequestId, RequestPath, RequestStatus,
};
use crate::stack::{StackLink, Status, StreamStackEntry};
use crate::statistics::{AverageWindow, Statistic, StatisticValue};

/// Options of a [`ReadSplitter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadSplitterConfig {
    /// Largest read forwarded to the next stage, and the size of a scratch slot.
    pub max_read_size: u64,
    /// Required alignment of the destination address of forwarded reads.
    pub memory_alignment: u64,
    /// Required alignment of the offset and size of forwarded reads.
    pub size_alignment: u64,
    /// Total size of the scratch buffer. Zero disables alignment correction.
    pub buffer_size: u64,
    /// Read misaligned offsets through the scratch buffer. When disabled, reads at a
    /// misaligned offset are rejected.
    pub adjust_offset: bool,
    /// Split aligned reads larger than `max_read_size`.
    pub split_aligned_requests: bool,
}

impl Default for ReadSplitterConfig {
    fn default() -> Self {
        Self {
            max_read_size: 1024 * 1024,
            memory_alignment: 64,
            size_alignment: 1,
            buffer_size: 4 * 1024 * 1024,
            adjust_offset: true,
            split_aligned_requests: true,
        }
    }
}

impl ReadSplitterConfig {
    pub fn validate(&self) -> StreamerResult<()> {
        if !self.memory_alignment.is_power_of_two() {
            streamer_bail!(
                InvalidConfiguration: "memory_alignment {} is not a power of two",
                self.memory_alignment
            );
        }
        if !self.size_alignment.is_power_of_two() {
            streamer_bail!(
                InvalidConfiguration: "size_alignment {} is not a power of two",
                self.size_alignment
            );
        }
        if self.max_read_size == 0
            || !is_aligned(self.max_read_size, self.memory_alignment)
            || !is_aligned(self.max_read_size, self.size_alignment)
        {
            streamer_bail!(
                InvalidConfiguration: "max_read_size {} must be a non-zero multiple of memory_alignment {} and size_alignment {}",
                self.max_read_size,
                self.memory_alignment,
                self.size_alignment
            );
        }
        if self.buffer_size != 0 && self.buffer_size < self.max_read_size {
            streamer_bail!(
                InvalidConfiguration: "buffer_size {} is smaller than one slot of {} bytes",
                self.buffer_size,
                self.max_read_size
            );
        }
        if self.adjust_offset && self.buffer_size == 0 {
            streamer_bail!(InvalidConfiguration: "adjust_offset requires a scratch buffer");
        }
        Ok(())
    }

    /// Number of scratch slots the buffer is divided into.
    pub fn num_slots(&self) -> u64 {
        self.buffer_size / self.max_read_size.max(1)
    }
}

/// Read-only settings derived from a validated [`ReadSplitterConfig`].
struct Settings {
    max_read_size: u64,
    memory_alignment: usize,
    size_alignment: u64,
    adjust_offset: bool,
    split_aligned_requests: bool,
    slot_size: usize,
    num_slots: usize,
}

impl Settings {
    fn new(config: &ReadSplitterConfig) -> StreamerResult<Self> {
        config.validate()?;
        let to_usize = |value: u64, what: &str| {
            usize::try_from(value).map_err(|_| {
                streamer_err!(InvalidConfiguration: "{} {} is too large", what, value)
            })
        };
        Ok(Self {
            max_read_size: config.max_read_size,
            memory_alignment: to_usize(config.memory_alignment, "memory_alignment")?,
            size_alignment: config.size_alignment,
            adjust_offset: config.adjust_offset,
            split_aligned_requests: config.split_aligned_requests,
            slot_size: to_usize(config.max_read_size, "max_read_size")?,
            num_slots: to_usize(config.num_slots(), "buffer_size")?,
        })
    }

    /// Whether the read already satisfies every constraint of the next stage.
    fn is_aligned_read(&self, read: &ReadData) -> bool {
        is_address_aligned(read.output.address(), self.memory_alignment)
            && is_aligned(read.size, self.size_alignment)
            && is_aligned(read.offset, self.size_alignment)
    }

    /// Why a misaligned read cannot be split, if it cannot.
    fn rejection(&self, read: &ReadData) -> Option<&'static str> {
        if self.num_slots == 0 {
            Some("no scratch buffer")
        } else if !self.adjust_offset && !is_aligned(read.offset, self.size_alignment) {
            Some("offset adjustment is disabled")
        } else {
            None
        }
    }
}

/// Progress of one read being split.
struct PendingRead {
    read: ReadData,
    /// Bytes of the read covered by dispatched sub-reads.
    consumed: u64,
    in_flight: usize,
    sub_reads: usize,
    failed: bool,
    /// Queued in the delayed FIFO, waiting for a scratch slot.
    waiting: bool,
    /// The splitter still holds a dependency on the original request.
    guard_held: bool,
}

impl PendingRead {
    fn remaining(&self) -> u64 {
        self.read.size - self.consumed
    }

    fn is_dispatched(&self) -> bool {
        self.consumed == self.read.size
    }
}

/// The scratch window to copy into the caller's buffer once a sub-read completes.
struct ScratchCopy {
    slot: usize,
    head: usize,
    target: BufferView,
}

/// The next sub-read to dispatch for a read.
struct SubRead {
    output: BufferView,
    offset: u64,
    size: u64,
    scratch: Option<ScratchCopy>,
}

#[derive(Default)]
struct SplitterState {
    pending: FxHashMap<RequestId, PendingRead>,
    free_slots: Vec<usize>,
    delayed: VecDeque<RequestId>,
    sub_reads_per_split: AverageWindow<64>,
}

struct SplitterMetrics {
    passthrough_reads: Arc<Counter>,
    split_reads: Arc<Counter>,
    sub_reads: Arc<Counter>,
    bytes_split: Arc<Counter>,
    scratch_copies: Arc<Counter>,
    bytes_copied: Arc<Counter>,
    delayed_reads: Arc<Counter>,
    rejected_reads: Arc<Counter>,
}

impl SplitterMetrics {
    fn new(metrics: &StreamerMetrics, name: &str) -> Self {
        let stage = metrics.stage(name);
        Self {
            passthrough_reads: stage.counter("passthrough_reads"),
            split_reads: stage.counter("split_reads"),
            sub_reads: stage.counter("sub_reads"),
            bytes_split: stage.counter("bytes_split"),
            scratch_copies: stage.counter("scratch_copies"),
            bytes_copied: stage.counter("bytes_copied"),
            delayed_reads: stage.counter("delayed_reads"),
            rejected_reads: stage.counter("rejected_reads"),
        }
    }
}

struct Splitter {
    link: StackLink,
    settings: Settings,
    scratch: IoBuffer,
    state: RefCell<SplitterState>,
    metrics: SplitterMetrics,
}

/// Splits oversized and misaligned reads into reads the next stage can serve.
///
/// See the [module documentation](self) for the algorithm.
pub struct ReadSplitter(Rc<Splitter>);

impl ReadSplitter {
    pub const NAME: &'static str = "read_splitter";

    pub fn new(config: &ReadSplitterConfig, metrics: &StreamerMetrics) -> StreamerResult<Self> {
        let settings = Settings::new(config)?;
        let scratch = IoBuffer::aligned(
            settings.num_slots * settings.slot_size,
            settings.memory_alignment,
        );
        let state = SplitterState {
            // Slot 0 is handed out first.
            free_slots: (0..settings.num_slots).rev().collect(),
            ..SplitterState::default()
        };
        log::debug!(
            "read splitter: max read {} bytes, {} scratch slots",
            settings.max_read_size,
            settings.num_slots
        );

        Ok(Self(Rc::new(Splitter {
            link: StackLink::new(Self::NAME),
            settings,
            scratch,
            state: RefCell::new(state),
            metrics: SplitterMetrics::new(metrics, Self::NAME),
        })))
    }

    /// Number of scratch slots currently reserved by in-flight sub-reads.
    pub fn slots_in_use(&self) -> usize {
        self.0.slots_in_use()
    }

    /// Number of reads waiting for a scratch slot.
    pub fn num_delayed(&self) -> usize {
        self.0.state.borrow().delayed.len()
    }
}

impl Splitter {
    fn context(&self) -> Rc<StreamerContext> {
        self.link
            .context()
            .streamer_expect("read splitter used before set_context")
    }

    fn slots_in_use(&self) -> usize {
        self.settings.num_slots - self.state.borrow().free_slots.len()
    }

    fn slot(&self, slot: usize) -> BufferView {
        let start = slot * self.settings.slot_size;
        self.scratch.view(start..start + self.settings.slot_size)
    }

    fn queue_request(self: &Rc<Self>, id: RequestId) {
        let context = self.context();
        let Some(read) = context
            .with_request(id, |request| request.command().as_read().cloned())
            .flatten()
        else {
            self.link.queue_request(id);
            return;
        };

        let aligned = self.settings.is_aligned_read(&read);
        if read.size == 0
            || (aligned
                && (read.size <= self.settings.max_read_size
                    || !self.settings.split_aligned_requests))
        {
            self.metrics.passthrough_reads.inc();
            self.link.queue_request(id);
            return;
        }

        if let Some(reason) = self.settings.rejection(&read).filter(|_| !aligned) {
            log::warn!(
                "rejecting misaligned read {id} of {} bytes at offset {}: {reason}",
                read.size,
                read.offset
            );
            self.metrics.rejected_reads.inc();
            context.with_request_mut(id, |request| request.set_status(RequestStatus::Failed));
            context.mark_request_as_completed(id);
            return;
        }

        log::trace!(
            "splitting read {id} of {} bytes at offset {}",
            read.size,
            read.offset
        );
        self.metrics.split_reads.inc();
        self.metrics.bytes_split.add(i64::try_from(read.size).unwrap_or(i64::MAX));
        context
            .add_dependency(id)
            .streamer_expect("queued read must be live");
        self.state.borrow_mut().pending.insert(
            id,
            PendingRead {
                read,
                consumed: 0,
                in_flight: 0,
                sub_reads: 0,
                failed: false,
                waiting: false,
                guard_held: true,
            },
        );

        self.pump(&context, id);
        self.settle(&context, id);
    }

    /// Dispatch sub-reads of `original` until it is fully dispatched, hits the in-flight
    /// cap, or has to wait for a scratch slot.
    fn pump(self: &Rc<Self>, context: &StreamerContext, original: RequestId) {
        loop {
            let Some((path, sub_read)) = self.next_sub_read(original) else {
                return;
            };
            self.dispatch(context, original, path, sub_read);
        }
    }

    fn next_sub_read(&self, original: RequestId) -> Option<(RequestPath, SubRead)> {
        let mut state = self.state.borrow_mut();
        let SplitterState {
            pending,
            free_slots,
            delayed,
            ..
        } = &mut *state;
        let pending_read = pending.get_mut(&original)?;
        if pending_read.failed
            || pending_read.waiting
            || pending_read.is_dispatched()
            || pending_read.in_flight >= MAX_NUM_DEPENDENCIES
        {
            return None;
        }

        let settings = &self.settings;
        let read = &pending_read.read;
        let offset = read.offset + pending_read.consumed;
        let remaining = pending_read.remaining();
        let start = window(pending_read.consumed);
        let address = read.output.address() + start;

        if is_address_aligned(address, settings.memory_alignment)
            && is_aligned(offset, settings.size_alignment)
        {
            let size = align_down(
                remaining.min(settings.max_read_size),
                settings.size_alignment,
            );
            if size > 0 {
                let sub_read = SubRead {
                    output: read.output.slice(start..start + window(size)),
                    offset,
                    size,
                    scratch: None,
                };
                pending_read.consumed += size;
                pending_read.in_flight += 1;
                pending_read.sub_reads += 1;
                return Some((read.path.clone(), sub_read));
            }
        }

        let Some(slot) = free_slots.pop() else {
            log::trace!("read {original} waits for a scratch slot");
            pending_read.waiting = true;
            delayed.push_back(original);
            self.metrics.delayed_reads.inc();
            return None;
        };

        let read_offset = align_down(offset, settings.size_alignment);
        let head = offset - read_offset;
        let size = settings
            .max_read_size
            .min(align_up(head + remaining, settings.size_alignment));
        let copy = (size - head).min(remaining);
        let sub_read = SubRead {
            output: self.slot(slot).slice(0..window(size)),
            offset: read_offset,
            size,
            scratch: Some(ScratchCopy {
                slot,
                head: window(head),
                target: read.output.slice(start..start + window(copy)),
            }),
        };
        pending_read.consumed += copy;
        pending_read.in_flight += 1;
        pending_read.sub_reads += 1;
        Some((read.path.clone(), sub_read))
    }

    fn dispatch(
        self: &Rc<Self>,
        context: &StreamerContext,
        original: RequestId,
        path: RequestPath,
        sub_read: SubRead,
    ) {
        let SubRead {
            output,
            offset,
            size,
            scratch,
        } = sub_read;

        let sub = context.get_new_internal_request();
        let splitter = Rc::downgrade(self);
        context.with_request_mut(sub, |request| {
            request.create_read(output, path, offset, size);
            request.set_completion_callback(move |sub_request: &FileRequest| {
                on_sub_read_completed(&splitter, original, sub_request.status(), scratch)
            });
        });
        if let Err(err) = context.set_parent(sub, original) {
            log::warn!("failing read {original}, sub-read {sub} cannot be attached: {err}");
            if let Some(pending_read) = self.state.borrow_mut().pending.get_mut(&original) {
                pending_read.failed = true;
            }
            context.with_request_mut(original, |request| request.set_status(RequestStatus::Failed));
            // Completing the detached sub-read as failed returns its scratch slot.
            context.with_request_mut(sub, |request| request.set_status(RequestStatus::Failed));
            context.mark_request_as_completed(sub);
            return;
        }

        self.metrics.sub_reads.inc();
        self.link.queue_request(sub);
    }

    fn complete_sub_read(
        self: &Rc<Self>,
        original: RequestId,
        status: RequestStatus,
        scratch: Option<ScratchCopy>,
    ) {
        let context = self.context();

        if let Some(ScratchCopy { slot, head, target }) = scratch {
            if status == RequestStatus::Completed {
                self.slot(slot).copy_into(head, target.len(), &target);
                self.metrics.scratch_copies.inc();
                self.metrics
                    .bytes_copied
                    .add(i64::try_from(target.len()).unwrap_or(i64::MAX));
            }
            self.state.borrow_mut().free_slots.push(slot);
        }

        if let Some(pending_read) = self.state.borrow_mut().pending.get_mut(&original) {
            pending_read.in_flight -= 1;
            if status.is_failure() {
                log::debug!("sub-read of {original} finished as {status}, failing the read");
                pending_read.failed = true;
            }
        }

        self.admit_delayed(&context);
        self.pump(&context, original);
        self.settle(&context, original);
    }

    /// Hand freed scratch slots to waiting reads, oldest first.
    fn admit_delayed(self: &Rc<Self>, context: &StreamerContext) {
        loop {
            let admitted = {
                let mut state = self.state.borrow_mut();
                if state.free_slots.is_empty() {
                    return;
                }
                let Some(id) = state.delayed.pop_front() else {
                    return;
                };
                if let Some(pending_read) = state.pending.get_mut(&id) {
                    pending_read.waiting = false;
                }
                id
            };
            self.pump(context, admitted);
            self.settle(context, admitted);
        }
    }

    /// Release the hold on `original` once nothing more will be dispatched for it, and
    /// forget it once its last sub-read has completed.
    fn settle(&self, context: &StreamerContext, original: RequestId) {
        let release = {
            let mut state = self.state.borrow_mut();
            let SplitterState {
                pending,
                delayed,
                sub_reads_per_split,
                ..
            } = &mut *state;
            let Some(pending_read) = pending.get_mut(&original) else {
                return;
            };

            if pending_read.failed && pending_read.waiting {
                delayed.retain(|id| *id != original);
                pending_read.waiting = false;
            }

            let release = pending_read.guard_held
                && !pending_read.waiting
                && (pending_read.failed || pending_read.is_dispatched());
            if release {
                pending_read.guard_held = false;
            }
            if !pending_read.guard_held && pending_read.in_flight == 0 {
                sub_reads_per_split.push(pending_read.sub_reads as f64);
                pending.remove(&original);
            }
            release
        };

        if release {
            context
                .release_dependency(original)
                .streamer_expect("split read must be live while held");
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let owner = self.link.name();
        let metrics = &self.metrics;
        let counter = |counter: &Arc<Counter>| StatisticValue::Integer(counter.count());
        let bytes = |counter: &Arc<Counter>| {
            StatisticValue::ByteSize(u64::try_from(counter.count()).unwrap_or_default())
        };

        let state = self.state.borrow();
        let slots_in_use = self.settings.num_slots - state.free_slots.len();
        let utilization = if self.settings.num_slots == 0 {
            0.0
        } else {
            100.0 * slots_in_use as f64 / self.settings.num_slots as f64
        };

        statistics.extend([
            Statistic::new(owner, "passthrough_reads", counter(&metrics.passthrough_reads)),
            Statistic::new(owner, "split_reads", counter(&metrics.split_reads)),
            Statistic::new(owner, "sub_reads", counter(&metrics.sub_reads)),
            Statistic::new(owner, "bytes_split", bytes(&metrics.bytes_split)),
            Statistic::new(owner, "scratch_copies", counter(&metrics.scratch_copies)),
            Statistic::new(owner, "bytes_copied", bytes(&metrics.bytes_copied)),
            Statistic::new(owner, "delayed_reads", counter(&metrics.delayed_reads)),
            Statistic::new(owner, "rejected_reads", counter(&metrics.rejected_reads)),
            Statistic::new(owner, "scratch_slots_in_use", StatisticValue::count(slots_in_use)),
            Statistic::new(
                owner,
                "scratch_utilization",
                StatisticValue::Percentage(utilization),
            ),
            Statistic::new(
                owner,
                "average_sub_reads",
                StatisticValue::Float(state.sub_reads_per_split.average()),
            ),
        ]);
        drop(state);

        self.link.collect_statistics(statistics);
    }
}

fn on_sub_read_completed(
    splitter: &Weak<Splitter>,
    original: RequestId,
    status: RequestStatus,
    scratch: Option<ScratchCopy>,
) {
    match splitter.upgrade() {
        Some(splitter) => splitter.complete_sub_read(original, status, scratch),
        None => log::debug!("sub-read of {original} completed after its splitter was dropped"),
    }
}

/// Sizes within a read are bounded by the length of its output view.
#[allow(clippy::cast_possible_truncation)]
fn window(bytes: u64) -> usize {
    bytes as usize
}

impl StreamStackEntry for ReadSplitter {
    fn name(&self) -> &str {
        self.0.link.name()
    }

    fn set_next(&self, next: Rc<dyn StreamStackEntry>) {
        self.0.link.set_next(next);
    }

    fn set_context(&self, context: Rc<StreamerContext>) {
        self.0.link.set_context(context);
    }

    fn queue_request(&self, request: RequestId) {
        self.0.queue_request(request);
    }

    fn execute_requests(&self) -> bool {
        self.0.link.execute_requests()
    }

    fn update_status(&self, status: &mut Status) {
        status.is_idle &= self.0.state.borrow().pending.is_empty();
        self.0.link.update_status(status);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.0.collect_statistics(statistics);
    }
}
