//! Layered asynchronous file streaming.
//!
//! Reads and file queries are [`FileRequest`]s owned by a [`StreamerContext`]. Requests
//! form a tree: a stage may split a request into children, and a parent completes once all
//! of its children have. Requests travel through a chain of [`StreamStackEntry`] stages
//! ending in a device such as the [`FileDevice`]. The [`ReadSplitter`] adapts arbitrary
//! reads to the size and alignment constraints of the stages below it.
//!
//! Stages and the context live on a single streamer thread. Devices signal completions
//! from their own threads through a [`CompletionSender`], and the streamer thread
//! finalizes them in drain cycles: [`StreamerContext::finalize_completed_requests`] runs
//! completion callbacks bottom-up and propagates completion to parents.
//!
//! [`StreamerStack`] drives a stack on the calling thread. [`Streamer`] runs one built from
//! a [`StreamerConfig`] on a dedicated thread and answers through futures.

pub use buffer::*;
pub use config::*;
pub use context::*;
pub use device::*;
pub use read_splitter::*;
pub use request::*;
pub use stack::*;
pub use statistics::*;
pub use streamer::*;

pub mod alignment;
mod buffer;
mod config;
mod context;
mod device;
mod read_splitter;
mod request;
mod stack;
mod statistics;
mod streamer;
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;
