//! Directory watches for completed capture files.
//!
//! Each configured location is a directory that an external capture
//! process writes rotated savefiles into. A file is ready once its writer
//! closes it, which the kernel reports as a close-after-write event.
//! Only direct children of a watched directory are reported.

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Cannot watch {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Location {} is already watched", .0.display())]
    DuplicateLocation(PathBuf),

    #[error("Unknown watch descriptor {0}")]
    NotFound(WatchDescriptor),

    #[error("Watch backend error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Location watcher is closed")]
    Closed,
}

/// Opaque handle of one directory watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchDescriptor(u64);

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub descriptor: WatchDescriptor,
    pub directory: PathBuf,
}

impl WatchEntry {
    pub fn path_of(&self, file_name: &OsStr) -> PathBuf {
        self.directory.join(file_name)
    }
}

/// A file closed after writing in a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReady {
    pub descriptor: WatchDescriptor,
    pub file_name: OsString,
}

pub struct LocationWatcher {
    backend: Option<RecommendedWatcher>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    entries: HashMap<WatchDescriptor, WatchEntry>,
    by_directory: HashMap<PathBuf, WatchDescriptor>,
    next_descriptor: u64,
}

impl LocationWatcher {
    /// Acquire the notification handle.
    pub fn new() -> Result<Self, WatchError> {
        let (tx, events) = mpsc::unbounded_channel();
        let backend = notify::recommended_watcher(move |event| {
            if tx.send(event).is_err() {
                debug!("Watch event dropped, receiver closed");
            }
        })?;

        Ok(Self {
            backend: Some(backend),
            events,
            entries: HashMap::new(),
            by_directory: HashMap::new(),
            next_descriptor: 1,
        })
    }

    pub fn add_location(&mut self, dir: impl AsRef<Path>) -> Result<WatchEntry, WatchError> {
        let dir = dir.as_ref();
        let directory = dir.canonicalize().map_err(|source| WatchError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if !directory.is_dir() {
            return Err(WatchError::NotADirectory(directory));
        }
        if self.by_directory.contains_key(&directory) {
            return Err(WatchError::DuplicateLocation(directory));
        }

        let backend = self.backend.as_mut().ok_or(WatchError::Closed)?;
        backend.watch(&directory, RecursiveMode::NonRecursive)?;

        let descriptor = WatchDescriptor(self.next_descriptor);
        self.next_descriptor += 1;
        let entry = WatchEntry {
            descriptor,
            directory: directory.clone(),
        };

        info!(descriptor = %descriptor, directory = %directory.display(), "Watching location");
        self.by_directory.insert(directory, descriptor);
        self.entries.insert(descriptor, entry.clone());
        Ok(entry)
    }

    pub fn resolve(&self, descriptor: WatchDescriptor) -> Result<&WatchEntry, WatchError> {
        self.entries
            .get(&descriptor)
            .ok_or(WatchError::NotFound(descriptor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for notifications, then drain everything already queued.
    ///
    /// Results keep the order the kernel reported them in. An empty vector
    /// means only irrelevant events arrived.
    pub async fn poll(&mut self) -> Result<Vec<FileReady>, WatchError> {
        let first = self.events.recv().await.ok_or(WatchError::Closed)?;

        let mut ready = Vec::new();
        self.collect(first, &mut ready);
        while let Ok(event) = self.events.try_recv() {
            self.collect(event, &mut ready);
        }
        Ok(ready)
    }

    fn collect(&self, event: notify::Result<Event>, ready: &mut Vec<FileReady>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Watch backend reported an error");
                return;
            }
        };

        for path in event.paths.iter().filter(|p| !p.is_dir()) {
            if let Some(file) = self.file_ready(&event.kind, path) {
                ready.push(file);
            }
        }
    }

    /// Map one notification path to a ready file, if it is one.
    fn file_ready(&self, kind: &EventKind, path: &Path) -> Option<FileReady> {
        if !matches!(kind, EventKind::Access(AccessKind::Close(AccessMode::Write))) {
            return None;
        }
        let descriptor = *self.by_directory.get(path.parent()?)?;
        Some(FileReady {
            descriptor,
            file_name: path.file_name()?.to_os_string(),
        })
    }

    /// Release every watch and the notification handle.
    pub fn close(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            for directory in self.by_directory.keys() {
                if let Err(e) = backend.unwatch(directory) {
                    warn!(directory = %directory.display(), error = %e, "Failed to remove watch");
                }
            }
        }
        self.entries.clear();
        self.by_directory.clear();
        self.backend = None;
        self.events.close();
        debug!("Location watcher closed");
    }
}
