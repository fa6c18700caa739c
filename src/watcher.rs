//! Modification-time scanner for the watched tree

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Instant, SystemTime};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Reports whether anything under `root` changed since the last successful rerun.
///
/// The watcher never moves its own timestamp: the caller advances it with
/// [`set_last_run`](Watcher::set_last_run) only after the rerun succeeded, so a
/// failed build keeps reporting the tree as dirty.
pub struct Watcher {
    root: PathBuf,
    ignore: Vec<PathBuf>,
    last_run: RwLock<SystemTime>,
    scans: AtomicUsize,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, ignore: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore,
            last_run: RwLock::new(SystemTime::now()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Walk the tree and return true on the first entry newer than the last run
    pub fn scan(&self) -> bool {
        let start = Instant::now();
        let since = *self.last_run.read();
        self.scans.fetch_add(1, Ordering::SeqCst);

        let modified = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.should_skip(e))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "watcher: skipping unreadable entry");
                    None
                }
            })
            .find(|entry| match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|m| m.modified())
            {
                Ok(mtime) => mtime > since,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "watcher: no mtime");
                    false
                }
            });

        if let Some(ref entry) = modified {
            debug!(path = %entry.path().display(), "watcher: found modified file");
        }
        info!(modified = modified.is_some(), "scan done in {:?}", start.elapsed());

        modified.is_some()
    }

    /// Move the last-run timestamp forward. Older timestamps are ignored.
    pub fn set_last_run(&self, at: SystemTime) {
        let mut last_run = self.last_run.write();
        if at > *last_run {
            *last_run = at;
        }
    }

    pub fn last_run(&self) -> SystemTime {
        *self.last_run.read()
    }

    /// Number of scans performed so far
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hidden directories (other than the root) and ignored directories are
    /// not descended into.
    fn should_skip(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            return true;
        }
        match entry.path().strip_prefix(&self.root) {
            Ok(relative) => self.ignore.iter().any(|dir| dir == relative),
            Err(_) => false,
        }
    }
}
