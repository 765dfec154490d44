//! Terminal stages that perform the actual I/O.

pub use file::*;

mod file;
mod handle_cache;
