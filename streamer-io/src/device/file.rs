use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::panic::resume_unwind;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use streamer_error::{StreamerExpect, StreamerResult, streamer_bail};
use streamer_metrics::{Counter, StreamerMetrics, Timer};

use crate::context::{CompletionSender, StreamerContext};
use crate::device::handle_cache::FileHandleCache;
use crate::request::{Command, ReadData, RequestId, RequestPath, RequestStatus};
use crate::stack::{StackLink, Status, StreamStackEntry};
use crate::statistics::{AverageWindow, Statistic, StatisticValue};

/// Options of a [`FileDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDeviceConfig {
    /// Stage name, used for statistics and metric names.
    pub name: String,
    /// Number of threads performing reads.
    pub worker_threads: usize,
    /// Reads handed to the workers at once.
    pub max_in_flight_reads: usize,
    /// Open file handles kept around between reads.
    pub max_file_handles: usize,
}

impl Default for FileDeviceConfig {
    fn default() -> Self {
        Self {
            name: "file_device".to_string(),
            worker_threads: 2,
            max_in_flight_reads: 8,
            max_file_handles: 32,
        }
    }
}

impl FileDeviceConfig {
    pub fn validate(&self) -> StreamerResult<()> {
        if self.name.is_empty() {
            streamer_bail!(InvalidConfiguration: "device name must not be empty");
        }
        if self.worker_threads == 0 {
            streamer_bail!(
                InvalidConfiguration: "device {} needs at least one worker thread",
                self.name
            );
        }
        if self.max_in_flight_reads == 0 {
            streamer_bail!(
                InvalidConfiguration: "device {} must allow at least one read in flight",
                self.name
            );
        }
        Ok(())
    }
}

struct ReadJob {
    request: RequestId,
    read: ReadData,
    completions: CompletionSender,
}

struct DeviceMetrics {
    reads: Arc<Counter>,
    bytes_read: Arc<Counter>,
    failed_reads: Arc<Counter>,
    read_time: Arc<Timer>,
}

/// State shared between the device and its worker threads.
struct Shared {
    handles: Mutex<FileHandleCache>,
    /// Reads holding an in-flight slot.
    active: AtomicUsize,
    /// Reads whose completion has not been sent yet. Trails `active`.
    outstanding: AtomicUsize,
    metrics: DeviceMetrics,
}

impl Shared {
    fn open(&self, path: &RequestPath) -> io::Result<Arc<File>> {
        if let Some(file) = self.handles.lock().get(path) {
            return Ok(file);
        }
        let file = Arc::new(File::open(path)?);
        Ok(self.handles.lock().insert(path.clone(), file))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip_all, fields(offset = read.offset, size = read.size))
    )]
    fn read(&self, read: &ReadData) -> io::Result<()> {
        let size = usize::try_from(read.size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read too large"))?;
        let file = self.open(&read.path)?;

        read.output.with_slice_mut(|output| {
            // A taken buffer has no bytes left to fill.
            if output.len() != size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read target no longer holds the requested bytes",
                ));
            }
            read_exact_at(&file, output, read.offset)
        })
    }

    fn run(&self, job: ReadJob) {
        let ReadJob {
            request,
            read,
            completions,
        } = job;

        let start = Instant::now();
        let status = match self.read(&read) {
            Ok(()) => {
                self.metrics.bytes_read.add(i64::try_from(read.size).unwrap_or(i64::MAX));
                RequestStatus::Completed
            }
            Err(err) => {
                log::warn!(
                    "read of {} bytes at {} from {} failed: {err}",
                    read.size,
                    read.offset,
                    read.path.display()
                );
                self.metrics.failed_reads.inc();
                RequestStatus::Failed
            }
        };
        self.metrics.read_time.update(start.elapsed());
        self.metrics.reads.inc();

        self.active.fetch_sub(1, Ordering::AcqRel);
        completions.mark_completed(request, status);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Threads executing reads, fed through a shared job queue.
struct WorkerPool {
    submitter: Option<flume::Sender<ReadJob>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(name: &str, num_threads: usize, shared: &Arc<Shared>) -> StreamerResult<Self> {
        let (submitter, rx) = flume::unbounded::<ReadJob>();
        let threads = (0..num_threads)
            .map(|tid| {
                let rx = rx.clone();
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-io-{tid}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            shared.run(job);
                        }
                    })
                    .map_err(|err| err.into())
            })
            .collect::<StreamerResult<Vec<_>>>()?;

        Ok(Self {
            submitter: Some(submitter),
            threads,
        })
    }

    fn submit(&self, job: ReadJob) -> Result<(), ReadJob> {
        match &self.submitter {
            Some(submitter) => submitter.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    /// Stop accepting jobs, let the workers drain the queue and join them.
    fn shutdown(mut self) {
        for thread in self.stop() {
            thread.join().unwrap_or_else(|err| resume_unwind(err));
        }
    }

    fn stop(&mut self) -> Vec<JoinHandle<()>> {
        // Each worker sees a disconnected channel once the queue is empty.
        drop(self.submitter.take());
        std::mem::take(&mut self.threads)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for thread in self.stop() {
            if thread.join().is_err() {
                log::error!("file device worker panicked");
            }
        }
    }
}

/// The terminal stage: performs reads on a pool of worker threads.
///
/// Reads wait in a queue until [`execute_requests`](StreamStackEntry::execute_requests) hands
/// them to the workers, at most `max_in_flight_reads` at a time. Workers report back through
/// the context's [`CompletionSender`]. File-exists and metadata queries are answered
/// synchronously on the streamer thread, one per call of `execute_requests`. Flushes drop
/// cached file handles and complete immediately.
pub struct FileDevice {
    link: StackLink,
    config: FileDeviceConfig,
    shared: Arc<Shared>,
    workers: RefCell<Option<WorkerPool>>,
    pending_reads: RefCell<VecDeque<RequestId>>,
    pending_queries: RefCell<VecDeque<RequestId>>,
    read_sizes: RefCell<AverageWindow<64>>,
}

impl FileDevice {
    pub fn new(config: FileDeviceConfig, metrics: &StreamerMetrics) -> StreamerResult<Self> {
        config.validate()?;
        let stage = metrics.stage(&config.name);
        let shared = Arc::new(Shared {
            handles: Mutex::new(FileHandleCache::new(config.max_file_handles)),
            active: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            metrics: DeviceMetrics {
                reads: stage.counter("reads"),
                bytes_read: stage.counter("bytes_read"),
                failed_reads: stage.counter("failed_reads"),
                read_time: stage.timer("read_time"),
            },
        });
        let workers = WorkerPool::new(&config.name, config.worker_threads, &shared)
            .map_err(|err| err.with_context(format!("starting {} workers", config.name)))?;
        log::debug!(
            "{}: {} workers, {} reads in flight",
            config.name,
            config.worker_threads,
            config.max_in_flight_reads
        );

        Ok(Self {
            link: StackLink::new(config.name.as_str()),
            config,
            shared,
            workers: RefCell::new(Some(workers)),
            pending_reads: RefCell::default(),
            pending_queries: RefCell::default(),
            read_sizes: RefCell::default(),
        })
    }

    /// Stop the workers after they finish the reads already handed to them.
    ///
    /// Reads queued afterwards fail. Panics of worker threads are propagated.
    pub fn shutdown(&self) {
        if let Some(workers) = self.workers.borrow_mut().take() {
            workers.shutdown();
        }
    }

    fn context(&self) -> Rc<StreamerContext> {
        self.link
            .context()
            .streamer_expect("file device used before set_context")
    }

    fn active_reads(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    fn dispatch_read(&self, context: &StreamerContext, request: RequestId) {
        let Some(read) = context
            .with_request(request, |r| r.command().as_read().cloned())
            .flatten()
        else {
            log::debug!("{}: dropping stale read {request}", self.config.name);
            return;
        };

        self.read_sizes.borrow_mut().push(read.size as f64);
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let job = ReadJob {
            request,
            read,
            completions: context.completion_sender(),
        };

        let submitted = match &*self.workers.borrow() {
            Some(workers) => workers.submit(job).is_ok(),
            None => false,
        };
        if !submitted {
            log::warn!("{}: workers are shut down, failing read {request}", self.config.name);
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            fail(context, request);
        }
    }

    fn service_query(&self, context: &StreamerContext, request: RequestId) {
        let status = context.with_request_mut(request, |r| match r.command_mut() {
            Command::FileExistsCheck(check) => {
                check.found = std::fs::metadata(&check.path).is_ok_and(|m| m.is_file());
                RequestStatus::Completed
            }
            Command::FileMetadata(metadata) => {
                metadata.file_size = std::fs::metadata(&metadata.path)
                    .ok()
                    .filter(|m| m.is_file())
                    .map(|m| m.len());
                if metadata.file_size.is_some() {
                    RequestStatus::Completed
                } else {
                    RequestStatus::Failed
                }
            }
            _ => RequestStatus::Failed,
        });

        if let Some(status) = status {
            context.with_request_mut(request, |r| r.set_status(status));
            context.mark_request_as_completed(request);
        }
    }
}

fn fail(context: &StreamerContext, request: RequestId) {
    context.with_request_mut(request, |r| r.set_status(RequestStatus::Failed));
    context.mark_request_as_completed(request);
}

impl StreamStackEntry for FileDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn set_next(&self, next: Rc<dyn StreamStackEntry>) {
        self.link.set_next(next);
    }

    fn set_context(&self, context: Rc<StreamerContext>) {
        self.link.set_context(context);
    }

    fn queue_request(&self, request: RequestId) {
        let context = self.context();
        let command = context.with_request(request, |r| match r.command() {
            Command::Read(_) => Some(Pending::Read),
            Command::FileExistsCheck(_) | Command::FileMetadata(_) => Some(Pending::Query),
            Command::Flush(flush) => Some(Pending::Flush(Some(flush.path.clone()))),
            Command::FlushAll => Some(Pending::Flush(None)),
            Command::Empty => None,
        });

        match command.flatten() {
            Some(Pending::Read) => self.pending_reads.borrow_mut().push_back(request),
            Some(Pending::Query) => self.pending_queries.borrow_mut().push_back(request),
            Some(Pending::Flush(path)) => {
                let mut handles = self.shared.handles.lock();
                match path {
                    Some(path) => {
                        handles.evict(&path);
                    }
                    None => {
                        let closed = handles.clear();
                        log::debug!("{}: closed {closed} file handles", self.config.name);
                    }
                }
                drop(handles);
                context.mark_request_as_completed(request);
            }
            None => self.link.queue_request(request),
        }
    }

    fn execute_requests(&self) -> bool {
        let context = self.context();
        let mut progressed = false;

        while self.active_reads() < self.config.max_in_flight_reads {
            let Some(request) = self.pending_reads.borrow_mut().pop_front() else {
                break;
            };
            self.dispatch_read(&context, request);
            progressed = true;
        }

        let query = self.pending_queries.borrow_mut().pop_front();
        if let Some(request) = query {
            self.service_query(&context, request);
            progressed = true;
        }

        progressed | self.link.execute_requests()
    }

    fn update_status(&self, status: &mut Status) {
        let active = self.active_reads();
        status.is_idle &= self.shared.outstanding.load(Ordering::Acquire) == 0
            && self.pending_reads.borrow().is_empty()
            && self.pending_queries.borrow().is_empty();
        status.num_available_slots = status
            .num_available_slots
            .min(self.config.max_in_flight_reads.saturating_sub(active));
        self.link.update_status(status);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let owner = self.link.name();
        let metrics = &self.shared.metrics;
        let mean_read_ms = if metrics.read_time.count() == 0 {
            0.0
        } else {
            metrics.read_time.snapshot().mean() / 1_000_000.0
        };
        let available = self
            .config
            .max_in_flight_reads
            .saturating_sub(self.active_reads());
        let bytes_read = u64::try_from(metrics.bytes_read.count()).unwrap_or_default();

        statistics.extend([
            Statistic::new(owner, "reads", StatisticValue::Integer(metrics.reads.count())),
            Statistic::new(owner, "bytes_read", StatisticValue::ByteSize(bytes_read)),
            Statistic::new(
                owner,
                "failed_reads",
                StatisticValue::Integer(metrics.failed_reads.count()),
            ),
            Statistic::new(owner, "mean_read_time_ms", StatisticValue::Float(mean_read_ms)),
            Statistic::new(
                owner,
                "average_read_size",
                StatisticValue::Float(self.read_sizes.borrow().average()),
            ),
            Statistic::new(
                owner,
                "cached_file_handles",
                StatisticValue::count(self.shared.handles.lock().len()),
            ),
            Statistic::new(owner, "available_slots", StatisticValue::count(available)),
        ]);
        self.link.collect_statistics(statistics);
    }
}

enum Pending {
    Read,
    Query,
    Flush(Option<RequestPath>),
}
