//! Read-only block store (C3, spec.md §4.3).
//!
//! Opens files on demand; never caches file handles across requests. Open
//! descriptor concurrency is bounded by a semaphore so a session with many
//! in-flight `block_request`s can't exhaust the process's file descriptor
//! table. Each read holds [`crate::filelock`]'s per-path read lock so it
//! can't observe a torn write from a concurrent local process (spec.md §5).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;

use crate::error::FilesystemError;
use crate::filelock;

/// Suggested cap on concurrently open file descriptors per session (spec.md §4.3).
const DEFAULT_MAX_OPEN_FILES: usize = 64;

/// Serves raw block bytes from a project root on the primary's filesystem.
pub struct BlockStore {
	root: PathBuf,
	open_files: Arc<Semaphore>,
}

impl BlockStore {
	pub fn new(root: PathBuf) -> Self {
		BlockStore::with_max_open_files(root, DEFAULT_MAX_OPEN_FILES)
	}

	pub fn with_max_open_files(root: PathBuf, max_open_files: usize) -> Self {
		BlockStore { root, open_files: Arc::new(Semaphore::new(max_open_files)) }
	}

	/// Reads block `block_index` of `rel_path`, which is at most
	/// `block_size` bytes starting at `block_index * block_size`.
	pub async fn read(
		&self,
		rel_path: &str,
		block_index: u64,
		block_size: u32,
	) -> Result<Vec<u8>, FilesystemError> {
		let _permit = self.open_files.acquire().await.expect("semaphore never closed");

		let abs_path = resolve(&self.root, rel_path)?;
		let offset = block_index
			.checked_mul(block_size as u64)
			.ok_or_else(|| FilesystemError::OutOfRange { path: rel_path.to_string(), block: block_index })?;

		let _read_guard = filelock::read_guard(&abs_path).await;

		let mut file = tokio::fs::File::open(&abs_path).await.map_err(|e| classify_open_error(rel_path, e))?;

		let len = file
			.metadata()
			.await
			.map_err(|e| FilesystemError::Io { path: rel_path.to_string(), source: e })?
			.len();
		if offset >= len && len != 0 {
			return Err(FilesystemError::OutOfRange { path: rel_path.to_string(), block: block_index });
		}
		if offset == 0 && len == 0 {
			return Ok(Vec::new());
		}

		file.seek(std::io::SeekFrom::Start(offset))
			.await
			.map_err(|e| FilesystemError::Io { path: rel_path.to_string(), source: e })?;

		let to_read = std::cmp::min(block_size as u64, len - offset) as usize;
		let mut buf = vec![0u8; to_read];
		file.read_exact(&mut buf)
			.await
			.map_err(|e| FilesystemError::Io { path: rel_path.to_string(), source: e })?;
		Ok(buf)
	}
}

/// Resolves `rel_path` against `root`, rejecting any path that would
/// escape it via `..` components.
fn resolve(root: &Path, rel_path: &str) -> Result<PathBuf, FilesystemError> {
	if rel_path.split('/').any(|part| part == "..") {
		return Err(FilesystemError::NotFound { path: rel_path.to_string() });
	}
	Ok(root.join(rel_path))
}

fn classify_open_error(rel_path: &str, e: std::io::Error) -> FilesystemError {
	match e.kind() {
		std::io::ErrorKind::NotFound => FilesystemError::NotFound { path: rel_path.to_string() },
		std::io::ErrorKind::PermissionDenied => FilesystemError::WriteDenied { path: rel_path.to_string() },
		_ => FilesystemError::Io { path: rel_path.to_string(), source: e },
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn reads_a_full_block() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
		let store = BlockStore::new(dir.path().to_path_buf());
		let block = store.read("a.txt", 0, 4).await.unwrap();
		assert_eq!(block, b"0123");
	}

	#[tokio::test]
	async fn reads_the_final_short_block() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
		let store = BlockStore::new(dir.path().to_path_buf());
		let block = store.read("a.txt", 2, 4).await.unwrap();
		assert_eq!(block, b"89");
	}

	#[tokio::test]
	async fn out_of_range_block_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
		let store = BlockStore::new(dir.path().to_path_buf());
		let err = store.read("a.txt", 99, 4).await.unwrap_err();
		assert!(matches!(err, FilesystemError::OutOfRange { .. }));
	}

	#[tokio::test]
	async fn missing_file_is_not_found() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlockStore::new(dir.path().to_path_buf());
		let err = store.read("missing.txt", 0, 4).await.unwrap_err();
		assert!(matches!(err, FilesystemError::NotFound { .. }));
	}

	#[tokio::test]
	async fn rejects_path_traversal() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlockStore::new(dir.path().to_path_buf());
		let err = store.read("../etc/passwd", 0, 4).await.unwrap_err();
		assert!(matches!(err, FilesystemError::NotFound { .. }));
	}
}

// vim: ts=4
