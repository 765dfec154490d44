//! Requests flowing through the streaming stack.
//!
//! A [`FileRequest`] is one unit of I/O work. Requests form a tree: a stage that decomposes
//! a request into smaller ones parents the new requests to the original, and the original
//! only completes once all of its children have. The requests themselves live in the arena
//! owned by [`StreamerContext`](crate::StreamerContext) and are addressed by [`RequestId`].

use std::fmt::{Debug, Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use crate::buffer::BufferView;

/// Maximum number of children a single request may have outstanding at once.
pub const MAX_NUM_DEPENDENCIES: usize = 64;

/// Path of the file a request operates on.
pub type RequestPath = Arc<Path>;

/// Callback invoked exactly once when a request is finalized.
pub type CompletionCallback = Box<dyn FnOnce(&FileRequest)>;

/// Stable handle to a request in the arena of a [`StreamerContext`](crate::StreamerContext).
///
/// Ids are generational: once a request is recycled its id goes stale, and the context will
/// not resolve it even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Lifecycle state of a request.
///
/// Status only moves forward: a request starts `Pending` and ends in exactly one of the
/// terminal states, which is never replaced afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    #[default]
    Pending,
    Completed,
    Canceled,
    Failed,
}

impl RequestStatus {
    pub fn is_pending(self) -> bool {
        self == RequestStatus::Pending
    }

    /// Returns true for statuses that a parent inherits from its children.
    pub fn is_failure(self) -> bool {
        matches!(self, RequestStatus::Canceled | RequestStatus::Failed)
    }
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::Canceled => "canceled",
            RequestStatus::Failed => "failed",
        })
    }
}

/// Read `size` bytes at `offset` of `path` into `output`.
#[derive(Debug, Clone)]
pub struct ReadData {
    pub output: BufferView,
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FileExistsCheckData {
    pub path: RequestPath,
    /// Filled in by the stage servicing the request.
    pub found: bool,
}

#[derive(Debug, Clone)]
pub struct FileMetadataData {
    pub path: RequestPath,
    /// Filled in by the stage servicing the request, `None` if the file could not be found.
    pub file_size: Option<u64>,
}

/// Release any cached resources held for `path`.
#[derive(Debug, Clone)]
pub struct FlushData {
    pub path: RequestPath,
}

/// The work a request carries.
#[derive(Debug, Clone, Default)]
pub enum Command {
    /// The request has not been configured yet.
    #[default]
    Empty,
    Read(ReadData),
    FileExistsCheck(FileExistsCheckData),
    FileMetadata(FileMetadataData),
    Flush(FlushData),
    /// Release all cached resources.
    FlushAll,
}

impl Command {
    pub fn as_read(&self) -> Option<&ReadData> {
        match self {
            Command::Read(read) => Some(read),
            _ => None,
        }
    }

    /// Short name of the command kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Empty => "empty",
            Command::Read(_) => "read",
            Command::FileExistsCheck(_) => "exists",
            Command::FileMetadata(_) => "metadata",
            Command::Flush(_) => "flush",
            Command::FlushAll => "flush_all",
        }
    }
}

/// One unit of I/O work and its place in the request tree.
pub struct FileRequest {
    pub(crate) command: Command,
    pub(crate) parent: Option<RequestId>,
    pub(crate) children: usize,
    pub(crate) holds: usize,
    pub(crate) callback: Option<CompletionCallback>,
    pub(crate) status: RequestStatus,
    pub(crate) internal: bool,
    pub(crate) finalized: bool,
}

impl FileRequest {
    pub(crate) fn new(internal: bool) -> Self {
        Self {
            command: Command::Empty,
            parent: None,
            children: 0,
            holds: 0,
            callback: None,
            status: RequestStatus::Pending,
            internal,
            finalized: false,
        }
    }

    /// Configure this request as a read of `size` bytes at `offset` into `output`.
    ///
    /// # Panics
    ///
    /// Panics if `output` is smaller than `size`.
    pub fn create_read(&mut self, output: BufferView, path: RequestPath, offset: u64, size: u64) {
        assert!(
            size <= output.len() as u64,
            "read of {size} bytes does not fit output of {} bytes",
            output.len()
        );
        self.command = Command::Read(ReadData {
            output,
            path,
            offset,
            size,
        });
    }

    pub fn create_file_exists_check(&mut self, path: RequestPath) {
        self.command = Command::FileExistsCheck(FileExistsCheckData { path, found: false });
    }

    pub fn create_file_metadata(&mut self, path: RequestPath) {
        self.command = Command::FileMetadata(FileMetadataData {
            path,
            file_size: None,
        });
    }

    pub fn create_flush(&mut self, path: RequestPath) {
        self.command = Command::Flush(FlushData { path });
    }

    pub fn create_flush_all(&mut self) {
        self.command = Command::FlushAll;
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// The request this one was split from, if any.
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// Number of outstanding children plus any dependencies held by stages.
    pub fn num_dependencies(&self) -> usize {
        self.children + self.holds
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Move the request to `status`.
    ///
    /// Only a pending request changes status, so the first terminal status sticks. Returns
    /// whether the status was updated.
    pub fn set_status(&mut self, status: RequestStatus) -> bool {
        if self.status.is_pending() && !status.is_pending() {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Register the callback run when the request is finalized, replacing any earlier one.
    pub fn set_completion_callback(&mut self, callback: impl FnOnce(&FileRequest) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Whether the request is recycled by the context as soon as it is finalized.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub const fn max_num_dependencies() -> usize {
        MAX_NUM_DEPENDENCIES
    }
}

impl Debug for FileRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("command", &self.command)
            .field("parent", &self.parent)
            .field("dependencies", &self.num_dependencies())
            .field("status", &self.status)
            .field("internal", &self.internal)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}
