//! Per-path read locks shared by the block store (C3) and the indexer (C1).
//!
//! A block read and a concurrent re-index of the same file are the two
//! local-process readers spec.md §5 worries about tearing on each other;
//! taking the same named lock for the duration of each read keeps them from
//! racing, without serialising reads of different files against each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::RwLock;

type Registry = Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>;

fn registry() -> &'static Registry {
	static REGISTRY: OnceLock<Registry> = OnceLock::new();
	REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_for(path: &Path) -> Arc<RwLock<()>> {
	let mut map = registry().lock().expect("file lock registry poisoned");
	map.entry(path.to_path_buf()).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
}

/// Acquires a read lock on `path` for the caller's async code (the block
/// store serving a `block_request`).
pub async fn read_guard(path: &Path) -> tokio::sync::OwnedRwLockReadGuard<()> {
	lock_for(path).read_owned().await
}

/// Acquires a read lock on `path` from blocking code — the indexer's walk
/// runs on a `spawn_blocking` thread, not inside an async task.
pub fn blocking_read_guard(path: &Path) -> tokio::sync::OwnedRwLockReadGuard<()> {
	lock_for(path).blocking_read_owned()
}


// vim: ts=4
