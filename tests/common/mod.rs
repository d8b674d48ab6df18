//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// A unique pool-file path under the system temp directory, removed on
/// drop.
pub struct TempPool {
    path: PathBuf,
}

impl TempPool {
    pub fn new(tag: &str) -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "pmfs-it-{}-{}-{}.pool",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPool {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Root-directory names, sorted for easy comparison.
pub fn root_names(pool: &pmfs::FilePool) -> Vec<String> {
    let mut names: Vec<String> = pool.list_root().into_iter().map(|e| e.name).collect();
    names.sort();
    names
}
