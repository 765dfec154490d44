//! Stack entries for testing stages in isolation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use streamer_error::StreamerExpect;

use crate::context::StreamerContext;
use crate::request::{ReadData, RequestId, RequestStatus};
use crate::stack::{StackLink, Status, StreamStackEntry};
use crate::statistics::{Statistic, StatisticValue};

/// A stage that records every request queued to it.
///
/// A terminal recording stage holds on to its requests until the test completes them with
/// [`complete`](Self::complete) or [`complete_from`](Self::complete_from), standing in for a
/// device. A forwarding one passes them on unchanged.
pub struct RecordingStage {
    link: StackLink,
    forward: bool,
    queued: RefCell<Vec<RequestId>>,
    pending: RefCell<VecDeque<RequestId>>,
}

impl RecordingStage {
    /// A terminal stage that keeps requests pending.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            link: StackLink::new("recording"),
            forward: false,
            queued: RefCell::default(),
            pending: RefCell::default(),
        })
    }

    /// A stage that records requests and forwards them to its successor.
    pub fn forwarding(name: &str) -> Rc<Self> {
        Rc::new(Self {
            link: StackLink::new(name),
            forward: true,
            queued: RefCell::default(),
            pending: RefCell::default(),
        })
    }

    /// Every request queued so far, in order.
    pub fn queued(&self) -> Vec<RequestId> {
        self.queued.borrow().clone()
    }

    pub fn num_queued(&self) -> usize {
        self.queued.borrow().len()
    }

    /// Requests queued and not yet completed, in order.
    pub fn pending(&self) -> Vec<RequestId> {
        self.pending.borrow().iter().copied().collect()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn context(&self) -> Rc<StreamerContext> {
        self.link
            .context()
            .streamer_expect("recording stage has no context")
    }

    /// The read command of a queued request.
    pub fn read(&self, id: RequestId) -> ReadData {
        self.context()
            .with_request(id, |request| request.command().as_read().cloned())
            .flatten()
            .streamer_expect("request is not a live read")
    }

    /// Complete a pending request with `status`, as a device thread would.
    pub fn complete(&self, id: RequestId, status: RequestStatus) {
        self.pending.borrow_mut().retain(|pending| *pending != id);
        self.context()
            .completion_sender()
            .mark_completed(id, status);
    }

    /// Serve a pending read from `source`, the full contents of the file being read.
    ///
    /// Reads reaching past the end of `source` copy what is available and fail.
    pub fn complete_from(&self, id: RequestId, source: &[u8]) {
        let read = self.read(id);
        let offset = usize::try_from(read.offset).unwrap_or(usize::MAX);
        let size = usize::try_from(read.size).unwrap_or(usize::MAX);
        let start = offset.min(source.len());
        let end = offset.saturating_add(size).min(source.len());
        read.output.write(0, &source[start..end]);

        let status = if end - start == size {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };
        self.complete(id, status);
    }

    /// Serve every pending read from `source`, oldest first.
    pub fn complete_all_from(&self, source: &[u8]) {
        for id in self.pending() {
            self.complete_from(id, source);
        }
    }
}

impl StreamStackEntry for RecordingStage {
    fn name(&self) -> &str {
        self.link.name()
    }

    fn set_next(&self, next: Rc<dyn StreamStackEntry>) {
        self.link.set_next(next);
    }

    fn set_context(&self, context: Rc<StreamerContext>) {
        self.link.set_context(context);
    }

    fn queue_request(&self, request: RequestId) {
        self.queued.borrow_mut().push(request);
        if self.forward {
            self.link.queue_request(request);
        } else {
            self.pending.borrow_mut().push_back(request);
        }
    }

    fn execute_requests(&self) -> bool {
        self.link.execute_requests()
    }

    fn update_status(&self, status: &mut Status) {
        status.is_idle &= self.pending.borrow().is_empty();
        self.link.update_status(status);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::new(
            self.link.name(),
            "queued",
            StatisticValue::count(self.num_queued()),
        ));
        self.link.collect_statistics(statistics);
    }
}
