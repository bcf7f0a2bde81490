//! Per-project filesystem change watcher (C8, spec.md §4.8).
//!
//! Not authoritative: emits at-least-once [`ChangeRecord`]s as an
//! optimisation hint, debounced over a short quiet window. The controller
//! always re-runs the full indexer before transferring — a watcher that
//! misses or coalesces events cannot cause incorrect sync, only a delayed
//! or redundant one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FilesystemError, SyncdError};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Modified,
	Deleted,
}

/// One coalesced filesystem change (spec.md §3 `ChangeRecord`).
#[derive(Debug, Clone)]
pub struct ChangeRecord {
	pub path: String,
	pub project_name: String,
	pub node_id: Option<u64>,
	pub kind: ChangeKind,
	pub size: Option<u64>,
	pub mtime: Option<i64>,
	pub error: Option<String>,
}

/// A running watcher for one project. Dropping or calling [`Self::stop`]
/// tears it down; its lifetime should track `ProjectSyncConfig.enabled`.
pub struct ProjectWatcher {
	cancel: CancellationToken,
	join: tokio::task::JoinHandle<()>,
	_watcher: RecommendedWatcher,
}

impl ProjectWatcher {
	/// Starts watching `root` recursively, emitting debounced
	/// [`ChangeRecord`]s for `project_name` onto `tx`.
	pub fn spawn(
		project_name: String,
		root: PathBuf,
		tx: mpsc::Sender<ChangeRecord>,
	) -> Result<Self, SyncdError> {
		Self::spawn_with_debounce(project_name, root, tx, DEFAULT_DEBOUNCE)
	}

	pub fn spawn_with_debounce(
		project_name: String,
		root: PathBuf,
		tx: mpsc::Sender<ChangeRecord>,
		debounce: Duration,
	) -> Result<Self, SyncdError> {
		let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Event>();

		let watcher = RecommendedWatcher::new(
			move |res: notify::Result<Event>| {
				if let Ok(event) = res {
					let _ = raw_tx.send(event);
				}
			},
			notify::Config::default(),
		)
		.map_err(|e| SyncdError::Filesystem(FilesystemError::Io {
			path: root.display().to_string(),
			source: std::io::Error::new(std::io::ErrorKind::Other, e),
		}))?;

		let mut watcher = watcher;
		watcher
			.watch(&root, RecursiveMode::Recursive)
			.map_err(|e| SyncdError::Filesystem(FilesystemError::Io {
				path: root.display().to_string(),
				source: std::io::Error::new(std::io::ErrorKind::Other, e),
			}))?;

		let cancel = CancellationToken::new();
		let join = tokio::spawn(debounce_loop(project_name, root, raw_rx, tx, debounce, cancel.clone()));

		Ok(ProjectWatcher { cancel, join, _watcher: watcher })
	}

	pub async fn stop(self) {
		self.cancel.cancel();
		let _ = self.join.await;
	}
}

async fn debounce_loop(
	project_name: String,
	root: PathBuf,
	mut raw_rx: mpsc::UnboundedReceiver<Event>,
	tx: mpsc::Sender<ChangeRecord>,
	debounce: Duration,
	cancel: CancellationToken,
) {
	let pending: Arc<Mutex<HashMap<String, ChangeKind>>> = Arc::new(Mutex::new(HashMap::new()));

	loop {
		tokio::select! {
			_ = cancel.cancelled() => return,
			event = raw_rx.recv() => {
				match event {
					Some(event) => record_event(&root, &event, &pending),
					None => return,
				}
			}
		}

		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(debounce) => {}
			more = raw_rx.recv() => {
				match more {
					Some(event) => {
						record_event(&root, &event, &pending);
						continue;
					}
					None => return,
				}
			}
		}

		let drained: Vec<(String, ChangeKind)> = {
			let mut guard = pending.lock().expect("watcher debounce mutex poisoned");
			guard.drain().collect()
		};
		for (rel_path, kind) in drained {
			let (size, mtime) = match kind {
				ChangeKind::Modified => stat(&root, &rel_path),
				ChangeKind::Deleted => (None, None),
			};
			let record = ChangeRecord {
				path: rel_path,
				project_name: project_name.clone(),
				node_id: None,
				kind,
				size,
				mtime,
				error: None,
			};
			if tx.send(record).await.is_err() {
				return;
			}
		}
	}
}

fn record_event(root: &Path, event: &Event, pending: &Arc<Mutex<HashMap<String, ChangeKind>>>) {
	let kind = match event.kind {
		EventKind::Remove(_) => ChangeKind::Deleted,
		EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any => ChangeKind::Modified,
		_ => return,
	};
	let mut guard = pending.lock().expect("watcher debounce mutex poisoned");
	for path in &event.paths {
		if let Some(rel) = posix_relative(root, path) {
			guard.insert(rel, kind);
		}
	}
}

fn posix_relative(root: &Path, path: &Path) -> Option<String> {
	let rel = path.strip_prefix(root).ok()?;
	let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
	if parts.is_empty() {
		None
	} else {
		Some(parts.join("/"))
	}
}

fn stat(root: &Path, rel_path: &str) -> (Option<u64>, Option<i64>) {
	match std::fs::metadata(root.join(rel_path)) {
		Ok(metadata) => (Some(metadata.len()), mtime_nanos(&metadata)),
		Err(_) => (None, None),
	}
}

#[cfg(unix)]
fn mtime_nanos(metadata: &std::fs::Metadata) -> Option<i64> {
	use std::os::unix::fs::MetadataExt;
	Some(metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec())
}

#[cfg(not(unix))]
fn mtime_nanos(metadata: &std::fs::Metadata) -> Option<i64> {
	metadata
		.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration as StdDuration;

	#[tokio::test]
	async fn reports_a_modified_file_after_debounce() {
		let dir = tempfile::tempdir().unwrap();
		let (tx, mut rx) = mpsc::channel(8);
		let watcher = ProjectWatcher::spawn_with_debounce(
			"demo".to_string(),
			dir.path().to_path_buf(),
			tx,
			StdDuration::from_millis(100),
		)
		.unwrap();

		tokio::time::sleep(StdDuration::from_millis(100)).await;
		std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

		let record = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
			.await
			.expect("timed out waiting for change record")
			.expect("channel closed");
		assert_eq!(record.project_name, "demo");
		assert_eq!(record.path, "a.txt");

		watcher.stop().await;
	}
}

// vim: ts=4
