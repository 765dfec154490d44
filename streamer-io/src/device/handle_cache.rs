use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::request::RequestPath;

/// Open file handles, evicting the least recently used beyond a fixed capacity.
pub(crate) struct FileHandleCache {
    capacity: usize,
    /// Most recently used last.
    handles: VecDeque<(RequestPath, Arc<File>)>,
}

impl FileHandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            handles: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the cached handle for `path`, marking it as most recently used.
    pub fn get(&mut self, path: &Path) -> Option<Arc<File>> {
        let position = self.handles.iter().position(|(p, _)| &**p == path)?;
        let entry = self.handles.remove(position)?;
        let file = entry.1.clone();
        self.handles.push_back(entry);
        Some(file)
    }

    /// Cache a freshly opened handle. If another thread cached the same path in the
    /// meantime, that handle wins and is returned instead.
    pub fn insert(&mut self, path: RequestPath, file: Arc<File>) -> Arc<File> {
        if let Some(existing) = self.get(&path) {
            return existing;
        }
        if self.capacity == 0 {
            return file;
        }
        while self.handles.len() >= self.capacity {
            if let Some((evicted, _)) = self.handles.pop_front() {
                log::trace!("closing file handle for {}", evicted.display());
            }
        }
        self.handles.push_back((path, file.clone()));
        file
    }

    /// Drop the handle for `path`. Returns whether one was cached.
    pub fn evict(&mut self, path: &Path) -> bool {
        let before = self.handles.len();
        self.handles.retain(|(p, _)| &**p != path);
        before != self.handles.len()
    }

    /// Drop every handle, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}
