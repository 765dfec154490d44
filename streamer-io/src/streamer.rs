//! Driving a stack, and the threaded [`Streamer`] in front of it.

use std::future::Future;
use std::panic::resume_unwind;
use std::path::Path;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{RecvError, TryRecvError};
use futures::FutureExt;
use futures::channel::oneshot;
use streamer_error::{ResultExt, StreamerError, StreamerResult, streamer_bail, streamer_err};
use streamer_metrics::StreamerMetrics;

use crate::buffer::IoBuffer;
use crate::config::StreamerConfig;
use crate::context::{Completion, StreamerContext};
use crate::request::{Command, FileRequest, RequestId, RequestPath, RequestStatus};
use crate::stack::{Status, StreamStackEntry};
use crate::statistics::Statistic;

/// Longest time the streamer thread sleeps without checking for new work.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// A stack together with the context its requests live in.
///
/// Single-threaded: requests are queued, executed and finalized on the calling thread.
pub struct StreamerStack {
    head: Rc<dyn StreamStackEntry>,
    context: Rc<StreamerContext>,
}

impl StreamerStack {
    pub fn new(head: Rc<dyn StreamStackEntry>) -> Self {
        let context = Rc::new(StreamerContext::new());
        head.set_context(context.clone());
        Self { head, context }
    }

    pub fn context(&self) -> &Rc<StreamerContext> {
        &self.context
    }

    pub fn queue_request(&self, request: RequestId) {
        self.head.queue_request(request);
    }

    /// Let every stage do its work, then finalize what completed. Returns whether anything
    /// happened.
    pub fn pump(&self) -> bool {
        let executed = self.head.execute_requests();
        let finalized = self.context.finalize_completed_requests();
        executed || finalized
    }

    pub fn status(&self) -> Status {
        let mut status = Status::default();
        self.head.update_status(&mut status);
        status
    }

    /// No stage holds work and no completion awaits finalization.
    pub fn is_idle(&self) -> bool {
        self.status().is_idle && !self.context.has_pending_completions()
    }

    /// Pump until the stack is idle, sleeping on completions while nothing moves.
    pub fn run_until_idle(&self, timeout: Duration) -> StreamerResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let progressed = self.pump();
            if self.is_idle() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                streamer_bail!(
                    InvalidState: "stack still busy after {}ms with {} active requests",
                    timeout.as_millis(),
                    self.context.num_active_requests()
                );
            }
            if !progressed {
                self.context.wait_for_completion(IDLE_WAIT.min(deadline - now));
            }
        }
    }

    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let mut statistics = Vec::new();
        self.head.collect_statistics(&mut statistics);
        statistics
    }
}

type Reply<T> = oneshot::Sender<StreamerResult<T>>;

enum Submission {
    Read {
        path: RequestPath,
        offset: u64,
        size: u64,
        reply: Reply<Bytes>,
    },
    FileExists {
        path: RequestPath,
        reply: Reply<bool>,
    },
    FileSize {
        path: RequestPath,
        reply: Reply<u64>,
    },
    Flush {
        path: Option<RequestPath>,
        reply: Reply<()>,
    },
    Statistics {
        reply: Reply<Vec<Statistic>>,
    },
}

/// The outcome of a request submitted to a [`Streamer`].
///
/// Resolves to [`StreamerError::RequestFailed`](streamer_error::StreamerError::RequestFailed)
/// if the stack failed the request, and to
/// [`StreamerError::Shutdown`](streamer_error::StreamerError::Shutdown) if the streamer
/// stopped before answering.
#[must_use = "a request handle does nothing unless awaited"]
pub struct RequestHandle<T>(oneshot::Receiver<StreamerResult<T>>);

impl<T> Future for RequestHandle<T> {
    type Output = StreamerResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|result| {
            result
                .map_err(|_| streamer_err!(Shutdown: "streamer stopped before answering"))
                .unnest()
        })
    }
}

/// A stack running on a dedicated thread.
///
/// The stack is built on that thread from a [`StreamerConfig`] and never leaves it. Every
/// method submits work over a channel and returns a [`RequestHandle`]; the handle is
/// `Send`, so callers may await it from any executor.
pub struct Streamer {
    submitter: Option<flume::Sender<Submission>>,
    thread: Option<JoinHandle<()>>,
}

impl Streamer {
    pub fn new(config: StreamerConfig) -> StreamerResult<Self> {
        Self::with_metrics(config, StreamerMetrics::default())
    }

    /// Start the streamer thread and build the stack, reporting errors of either.
    pub fn with_metrics(config: StreamerConfig, metrics: StreamerMetrics) -> StreamerResult<Self> {
        config.validate()?;
        let alignment = usize::try_from(config.preferred_alignment())
            .map_err(|_| streamer_err!(InvalidConfiguration: "memory alignment exceeds usize"))?;

        let (submitter, submissions) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);
        let thread = std::thread::Builder::new()
            .name("streamer".to_string())
            .spawn(move || {
                let head = match config.build_stack(&metrics) {
                    Ok(head) => head,
                    Err(err) => {
                        ready_tx.send(Err(err)).ok();
                        return;
                    }
                };
                ready_tx.send(Ok(())).ok();
                StreamerThread {
                    stack: StreamerStack::new(head),
                    submissions,
                    alignment,
                }
                .run();
            })
            .map_err(|err| StreamerError::from(err).with_context("spawning streamer"))?;

        let startup = ready_rx
            .recv()
            .map_err(|_| streamer_err!(Shutdown: "streamer thread exited during startup"))
            .unnest();
        if let Err(err) = startup {
            thread.join().unwrap_or_else(|panic| resume_unwind(panic));
            return Err(err);
        }

        Ok(Self {
            submitter: Some(submitter),
            thread: Some(thread),
        })
    }

    /// Read `size` bytes of `path` starting at `offset`.
    pub fn read(&self, path: impl AsRef<Path>, offset: u64, size: u64) -> RequestHandle<Bytes> {
        let path = RequestPath::from(path.as_ref());
        self.submit(|reply| Submission::Read {
            path,
            offset,
            size,
            reply,
        })
    }

    pub fn file_exists(&self, path: impl AsRef<Path>) -> RequestHandle<bool> {
        let path = RequestPath::from(path.as_ref());
        self.submit(|reply| Submission::FileExists { path, reply })
    }

    pub fn file_size(&self, path: impl AsRef<Path>) -> RequestHandle<u64> {
        let path = RequestPath::from(path.as_ref());
        self.submit(|reply| Submission::FileSize { path, reply })
    }

    /// Drop cached state for `path`, such as open file handles.
    pub fn flush(&self, path: impl AsRef<Path>) -> RequestHandle<()> {
        let path = RequestPath::from(path.as_ref());
        self.submit(|reply| Submission::Flush {
            path: Some(path),
            reply,
        })
    }

    pub fn flush_all(&self) -> RequestHandle<()> {
        self.submit(|reply| Submission::Flush { path: None, reply })
    }

    /// Statistics of every stage, head first.
    pub fn statistics(&self) -> RequestHandle<Vec<Statistic>> {
        self.submit(|reply| Submission::Statistics { reply })
    }

    /// Finish all submitted requests and stop the streamer thread.
    ///
    /// Panics of the streamer thread are propagated.
    pub fn shutdown(mut self) {
        drop(self.submitter.take());
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap_or_else(|panic| resume_unwind(panic));
        }
    }

    fn submit<T>(&self, submission: impl FnOnce(Reply<T>) -> Submission) -> RequestHandle<T> {
        let (reply, handle) = oneshot::channel();
        if let Some(submitter) = &self.submitter {
            // A closed channel drops the reply, which resolves the handle as shut down.
            submitter.send(submission(reply)).ok();
        }
        RequestHandle(handle)
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        drop(self.submitter.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("streamer thread panicked");
            }
        }
    }
}

enum Event {
    Submission(Result<Submission, RecvError>),
    Completion(Result<Completion, RecvError>),
}

struct StreamerThread {
    stack: StreamerStack,
    submissions: flume::Receiver<Submission>,
    alignment: usize,
}

impl StreamerThread {
    fn run(self) {
        log::debug!("streamer started");
        let mut accepting = true;
        loop {
            if accepting {
                accepting = self.drain_submissions();
            }
            let progressed = self.stack.pump();
            if !accepting && self.stack.is_idle() {
                break;
            }
            if progressed {
                continue;
            }

            if accepting {
                accepting = self.wait_for_event();
            } else {
                self.stack.context().wait_for_completion(IDLE_WAIT);
            }
        }
        log::debug!(
            "streamer stopped with {} active requests",
            self.stack.context().num_active_requests()
        );
    }

    /// Returns whether submissions may still arrive.
    fn drain_submissions(&self) -> bool {
        loop {
            match self.submissions.try_recv() {
                Ok(submission) => self.accept(submission),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Sleep until a submission or a completion arrives. Returns whether submissions may
    /// still arrive.
    fn wait_for_event(&self) -> bool {
        let event = flume::Selector::new()
            .recv(&self.submissions, Event::Submission)
            .recv(self.stack.context().completion_receiver(), Event::Completion)
            .wait_timeout(IDLE_WAIT);
        match event {
            Ok(Event::Submission(Ok(submission))) => self.accept(submission),
            Ok(Event::Submission(Err(RecvError::Disconnected))) => return false,
            Ok(Event::Completion(Ok(completion))) => {
                self.stack.context().defer_completion(completion);
            }
            // The context keeps a sender alive, so its channel never disconnects.
            Ok(Event::Completion(Err(RecvError::Disconnected))) | Err(_) => {}
        }
        true
    }

    fn accept(&self, submission: Submission) {
        let context = self.stack.context();
        match submission {
            Submission::Read {
                path,
                offset,
                size,
                reply,
            } => {
                let Ok(len) = usize::try_from(size) else {
                    reply
                        .send(Err(streamer_err!("read of {} bytes exceeds memory", size)))
                        .ok();
                    return;
                };
                let buffer = IoBuffer::aligned(len, self.alignment);
                let request = context.get_new_internal_request();
                context.with_request_mut(request, |r| {
                    r.create_read(buffer.full_view(), path, offset, size);
                    r.set_completion_callback(move |r| {
                        let result = succeeded(r).map(|()| buffer.take_bytes());
                        reply.send(result).ok();
                    });
                });
                self.stack.queue_request(request);
            }
            Submission::FileExists { path, reply } => {
                let request = context.get_new_internal_request();
                context.with_request_mut(request, |r| {
                    r.create_file_exists_check(path);
                    r.set_completion_callback(move |r| {
                        let result = succeeded(r).map(|()| match r.command() {
                            Command::FileExistsCheck(check) => check.found,
                            _ => false,
                        });
                        reply.send(result).ok();
                    });
                });
                self.stack.queue_request(request);
            }
            Submission::FileSize { path, reply } => {
                let request = context.get_new_internal_request();
                context.with_request_mut(request, |r| {
                    r.create_file_metadata(path);
                    r.set_completion_callback(move |r| {
                        let result = succeeded(r).and_then(|()| match r.command() {
                            Command::FileMetadata(metadata) => metadata.file_size.ok_or_else(
                                || streamer_err!(RequestFailed: "{} has no size", metadata.path.display()),
                            ),
                            _ => Err(streamer_err!(RequestFailed: "not a metadata request")),
                        });
                        reply.send(result).ok();
                    });
                });
                self.stack.queue_request(request);
            }
            Submission::Flush { path, reply } => {
                let request = context.get_new_internal_request();
                context.with_request_mut(request, |r| {
                    match path {
                        Some(path) => r.create_flush(path),
                        None => r.create_flush_all(),
                    }
                    r.set_completion_callback(move |r| {
                        reply.send(succeeded(r)).ok();
                    });
                });
                self.stack.queue_request(request);
            }
            Submission::Statistics { reply } => {
                reply.send(Ok(self.stack.collect_statistics())).ok();
            }
        }
    }
}

fn succeeded(request: &FileRequest) -> StreamerResult<()> {
    match request.status() {
        RequestStatus::Completed => Ok(()),
        status => Err(streamer_err!(
            RequestFailed: "{} request {}",
            request.command().kind(),
            status
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::rc::Rc;
    use std::time::Duration;

    use futures::executor::block_on;
    use streamer_error::StreamerError;
    use streamer_metrics::StreamerMetrics;
    use tempfile::NamedTempFile;

    use crate::buffer::IoBuffer;
    use crate::config::StreamerConfig;
    use crate::read_splitter::{ReadSplitter, ReadSplitterConfig};
    use crate::request::RequestStatus;
    use crate::stack::{StreamStackEntry, link_stages};
    use crate::streamer::{Streamer, StreamerStack};
    use crate::testing::RecordingStage;

    fn data_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data = (0..len)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect::<Vec<_>>();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    #[test]
    fn run_until_idle_times_out_on_stuck_stage() {
        let recording = RecordingStage::new();
        let stack = StreamerStack::new(recording.clone() as Rc<dyn StreamStackEntry>);
        let context = stack.context();

        let buffer = IoBuffer::new(16);
        let request = context.get_new_external_request();
        context.with_request_mut(request, |r| {
            r.create_read(buffer.full_view(), Path::new("a").into(), 0, 16)
        });
        stack.queue_request(request);

        let err = stack.run_until_idle(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, StreamerError::InvalidState(_)));

        recording.complete_from(request, &[7; 16]);
        stack.run_until_idle(Duration::from_secs(1)).unwrap();
        assert_eq!(context.status(request), Some(RequestStatus::Completed));
        assert_eq!(buffer.to_vec(), vec![7; 16]);
        context.recycle_request(request).unwrap();
        assert_eq!(context.num_active_requests(), 0);
    }

    #[test]
    fn statistics_cover_every_stage() {
        let splitter = ReadSplitter::new(&ReadSplitterConfig::default(), &StreamerMetrics::default())
            .unwrap();
        let head = link_stages(vec![
            Rc::new(splitter) as Rc<dyn StreamStackEntry>,
            RecordingStage::new() as Rc<dyn StreamStackEntry>,
        ])
        .unwrap();
        let stack = StreamerStack::new(head);
        assert!(stack.is_idle());

        let statistics = stack.collect_statistics();
        assert!(statistics.iter().any(|s| &*s.owner == "read_splitter"));
        assert!(statistics.iter().any(|s| &*s.owner == "recording"));
    }

    #[test]
    fn streamer_reads_and_queries() {
        let (file, data) = data_file(10_000);
        let config = StreamerConfig::from_json(
            r#"{ "read_splitter": { "max_read_size": 1024, "buffer_size": 4096 } }"#,
        )
        .unwrap();
        let streamer = Streamer::new(config).unwrap();

        let bytes = block_on(streamer.read(file.path(), 100, 5000)).unwrap();
        assert_eq!(&bytes[..], &data[100..5100]);

        assert!(block_on(streamer.file_exists(file.path())).unwrap());
        assert!(!block_on(streamer.file_exists("/does/not/exist")).unwrap());
        assert_eq!(block_on(streamer.file_size(file.path())).unwrap(), 10_000);

        let err = block_on(streamer.read(file.path(), 9_000, 2_000)).unwrap_err();
        assert!(matches!(err, StreamerError::RequestFailed(_)));
        let err = block_on(streamer.file_size("/does/not/exist")).unwrap_err();
        assert!(matches!(err, StreamerError::RequestFailed(_)));

        block_on(streamer.flush(file.path())).unwrap();
        block_on(streamer.flush_all()).unwrap();

        let statistics = block_on(streamer.statistics()).unwrap();
        assert!(
            statistics
                .iter()
                .any(|s| &*s.owner == "read_splitter" && s.name == "split_reads")
        );
        streamer.shutdown();
    }

    #[test]
    fn streamer_serves_reads_split_into_many_parts() {
        let (file, data) = data_file(256 * 1024);
        let config = StreamerConfig::from_json(
            r#"{ "read_splitter": { "max_read_size": 256, "size_alignment": 64, "buffer_size": 4096 } }"#,
        )
        .unwrap();
        let streamer = Streamer::new(config).unwrap();

        // Aligned: more parts in flight than a request may have children.
        let aligned = streamer.read(file.path(), 0, 400 * 256);
        // Misaligned offset: every part goes through the scratch slots.
        let misaligned = streamer.read(file.path(), 333, 200_000);

        assert_eq!(&block_on(aligned).unwrap()[..], &data[..400 * 256]);
        assert_eq!(&block_on(misaligned).unwrap()[..], &data[333..200_333]);
        streamer.shutdown();
    }

    #[tokio::test]
    async fn concurrent_reads_from_async_callers() {
        let (file, data) = data_file(64 * 1024);
        let streamer = Streamer::new(StreamerConfig::default()).unwrap();

        let handles = (0..16u64)
            .map(|i| streamer.read(file.path(), i * 4096, 4096))
            .collect::<Vec<_>>();
        for (i, handle) in handles.into_iter().enumerate() {
            let bytes = handle.await.unwrap();
            assert_eq!(&bytes[..], &data[i * 4096..(i + 1) * 4096]);
        }
        streamer.shutdown();
    }

    #[test]
    fn invalid_config_is_reported_by_constructor() {
        let config = StreamerConfig {
            read_splitter: Some(ReadSplitterConfig {
                memory_alignment: 3,
                ..ReadSplitterConfig::default()
            }),
            ..StreamerConfig::default()
        };
        assert!(matches!(
            Streamer::new(config),
            Err(StreamerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn dropping_the_streamer_finishes_outstanding_reads() {
        let (file, data) = data_file(8192);
        let streamer = Streamer::new(StreamerConfig::default()).unwrap();
        let handle = streamer.read(file.path(), 0, 8192);
        drop(streamer);
        assert_eq!(&block_on(handle).unwrap()[..], &data[..]);
    }
}
