//! Block-level directory indexer (C1, spec.md §4.1).
//!
//! Walks a project root depth-first in lexicographic POSIX-path order and
//! streams one [`FileIndexEntry`] per path into a bounded channel, so the
//! session layer can start sending `index_file` frames before the walk
//! finishes. The walk and the hashing are both blocking I/O, so the whole
//! thing runs on a blocking thread; only the channel send crosses back
//! into async land.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::error::{FilesystemError, SyncdError};
use crate::filelock;
use crate::ignore::IgnoreMatcher;
use crate::wire::messages::FileIndexEntry;

/// Smallest block size the adaptive rule will choose (128 KiB).
const MIN_BLOCK_SIZE: u32 = 1 << 17;

/// Largest block size the adaptive rule will choose (4 MiB).
const MAX_BLOCK_SIZE: u32 = 1 << 22;

/// Maximum number of blocks a file's index may have before the block size
/// is doubled (spec.md §3 `FileIndexEntry` invariants).
const MAX_BLOCKS_PER_FILE: u64 = 256;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// The smallest power-of-two block size in `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`
/// such that `ceil(size/blockSize) <= 256` (spec.md §3).
pub fn block_size_for(size: u64) -> u32 {
	let mut block_size = MIN_BLOCK_SIZE;
	while block_size < MAX_BLOCK_SIZE {
		let block_count = (size + block_size as u64 - 1) / block_size as u64;
		if block_count <= MAX_BLOCKS_PER_FILE {
			break;
		}
		block_size <<= 1;
	}
	block_size
}

/// Stream a [`FileIndexEntry`] for every non-ignored path under `root`
/// into `tx`, depth-first in lexicographic order. Runs the walk on a
/// blocking thread and returns once it completes or the receiver drops.
pub async fn index_project(
	root: std::path::PathBuf,
	ignore: Arc<IgnoreMatcher>,
	ignore_permissions: bool,
	tx: mpsc::Sender<Result<FileIndexEntry, SyncdError>>,
) -> Result<(), SyncdError> {
	tokio::task::spawn_blocking(move || walk(&root, &ignore, ignore_permissions, &tx))
		.await
		.map_err(|e| SyncdError::Other { message: format!("indexer task panicked: {}", e) })?
}

fn walk(
	root: &Path,
	ignore: &IgnoreMatcher,
	ignore_permissions: bool,
	tx: &mpsc::Sender<Result<FileIndexEntry, SyncdError>>,
) -> Result<(), SyncdError> {
	let mut walker = walkdir::WalkDir::new(root)
		.min_depth(1)
		.sort_by(|a, b| a.file_name().cmp(b.file_name()))
		.into_iter();

	loop {
		let dent = match walker.next() {
			None => break,
			Some(Ok(d)) => d,
			Some(Err(e)) => {
				let io_err = e.into_io_error().unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error"));
				let err = SyncdError::Filesystem(FilesystemError::Io { path: root.display().to_string(), source: io_err });
				if tx.blocking_send(Err(err)).is_err() {
					return Ok(());
				}
				continue;
			}
		};

		let rel_path = match posix_relative(root, dent.path()) {
			Some(p) => p,
			None => continue,
		};

		let file_type = dent.file_type();
		let is_dir = file_type.is_dir();
		if ignore.is_ignored(&rel_path, is_dir) {
			if is_dir {
				walker.skip_current_dir();
			}
			continue;
		}

		let entry = if file_type.is_symlink() {
			match build_symlink_entry(dent.path(), rel_path) {
				Ok(e) => e,
				Err(err) => {
					if tx.blocking_send(Err(err)).is_err() {
						return Ok(());
					}
					continue;
				}
			}
		} else if is_dir {
			match is_empty_dir(dent.path()) {
				Ok(true) => build_empty_dir_entry(rel_path, ignore_permissions),
				Ok(false) => continue,
				Err(err) => {
					if tx.blocking_send(Err(err)).is_err() {
						return Ok(());
					}
					continue;
				}
			}
		} else if file_type.is_file() {
			match build_file_entry(dent.path(), rel_path, ignore_permissions) {
				Ok(e) => e,
				Err(err) => {
					if tx.blocking_send(Err(err)).is_err() {
						return Ok(());
					}
					continue;
				}
			}
		} else {
			continue;
		};

		if tx.blocking_send(Ok(entry)).is_err() {
			return Ok(());
		}
	}

	Ok(())
}

fn posix_relative(root: &Path, path: &Path) -> Option<String> {
	let rel = path.strip_prefix(root).ok()?;
	let mut parts = Vec::new();
	for component in rel.components() {
		parts.push(component.as_os_str().to_string_lossy().into_owned());
	}
	Some(parts.join("/"))
}

fn is_empty_dir(path: &Path) -> Result<bool, SyncdError> {
	let mut entries = fs::read_dir(path)
		.map_err(|e| SyncdError::Filesystem(FilesystemError::Io { path: path.display().to_string(), source: e }))?;
	Ok(entries.next().is_none())
}

fn build_empty_dir_entry(rel_path: String, ignore_permissions: bool) -> FileIndexEntry {
	FileIndexEntry {
		path: rel_path,
		size: 0,
		mtime: 0,
		mode: if ignore_permissions { DEFAULT_DIR_MODE } else { DEFAULT_DIR_MODE },
		block_size: MIN_BLOCK_SIZE,
		blocks: Vec::new(),
		dir: true,
		symlink_target: None,
	}
}

fn build_symlink_entry(path: &Path, rel_path: String) -> Result<FileIndexEntry, SyncdError> {
	let target = fs::read_link(path)
		.map_err(|e| SyncdError::Filesystem(FilesystemError::Io { path: rel_path.clone(), source: e }))?;
	Ok(FileIndexEntry {
		path: rel_path,
		size: 0,
		mtime: 0,
		mode: 0,
		block_size: MIN_BLOCK_SIZE,
		blocks: Vec::new(),
		dir: false,
		symlink_target: Some(target.to_string_lossy().into_owned()),
	})
}

fn build_file_entry(path: &Path, rel_path: String, ignore_permissions: bool) -> Result<FileIndexEntry, SyncdError> {
	let _read_guard = filelock::blocking_read_guard(path);

	let metadata = fs::metadata(path)
		.map_err(|e| SyncdError::Filesystem(FilesystemError::Io { path: rel_path.clone(), source: e }))?;
	let size = metadata.len();
	let block_size = block_size_for(size);
	let mode = file_mode(&metadata, ignore_permissions);
	let mtime = mtime_nanos(&metadata);

	let mut file = fs::File::open(path)
		.map_err(|e| SyncdError::Filesystem(FilesystemError::Io { path: rel_path.clone(), source: e }))?;
	let mut blocks = Vec::with_capacity(FileIndexEntry::expected_block_count(size, block_size));
	let mut buf = vec![0u8; block_size as usize];
	loop {
		let n = read_full_or_eof(&mut file, &mut buf)
			.map_err(|e| SyncdError::Filesystem(FilesystemError::Io { path: rel_path.clone(), source: e }))?;
		if n == 0 {
			break;
		}
		let mut hasher = Sha256::new();
		hasher.update(&buf[..n]);
		let digest: [u8; 32] = hasher.finalize().into();
		blocks.push(digest);
		if n < buf.len() {
			break;
		}
	}

	Ok(FileIndexEntry { path: rel_path, size, mtime, mode, block_size, blocks, dir: false, symlink_target: None })
}

/// Reads up to `buf.len()` bytes, returning fewer only at EOF (unlike a
/// single `Read::read` call, which may return short reads mid-stream).
fn read_full_or_eof(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		match file.read(&mut buf[filled..])? {
			0 => break,
			n => filled += n,
		}
	}
	Ok(filled)
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata, ignore_permissions: bool) -> u32 {
	use std::os::unix::fs::PermissionsExt;
	if ignore_permissions {
		DEFAULT_FILE_MODE
	} else {
		metadata.permissions().mode() & 0o7777
	}
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata, _ignore_permissions: bool) -> u32 {
	DEFAULT_FILE_MODE
}

#[cfg(unix)]
fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
	use std::os::unix::fs::MetadataExt;
	metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec()
}

#[cfg(not(unix))]
fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
	metadata
		.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_nanos() as i64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ignore::IgnoreMatcher;
	use std::sync::Arc;

	#[test]
	fn block_size_rule_stays_within_bounds_for_tiny_files() {
		assert_eq!(block_size_for(0), MIN_BLOCK_SIZE);
		assert_eq!(block_size_for(100), MIN_BLOCK_SIZE);
	}

	#[test]
	fn block_size_rule_doubles_until_under_256_blocks() {
		let size = (MIN_BLOCK_SIZE as u64) * 300;
		let bs = block_size_for(size);
		assert!(bs > MIN_BLOCK_SIZE);
		let count = (size + bs as u64 - 1) / bs as u64;
		assert!(count <= MAX_BLOCKS_PER_FILE);
	}

	#[test]
	fn block_size_rule_clamps_at_the_maximum() {
		let huge = (MAX_BLOCK_SIZE as u64) * 1000;
		assert_eq!(block_size_for(huge), MAX_BLOCK_SIZE);
	}

	#[tokio::test]
	async fn walks_a_small_tree_in_lexicographic_order() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
		std::fs::write(dir.path().join("a.txt"), b"world").unwrap();
		std::fs::create_dir(dir.path().join("empty")).unwrap();

		let ignore = Arc::new(IgnoreMatcher::new(true, &[], None));
		let (tx, mut rx) = mpsc::channel(8);
		index_project(dir.path().to_path_buf(), ignore, false, tx).await.unwrap();

		let mut paths = Vec::new();
		while let Some(entry) = rx.recv().await {
			paths.push(entry.unwrap().path);
		}
		assert_eq!(paths, vec!["a.txt".to_string(), "b.txt".to_string(), "empty".to_string()]);
	}

	#[tokio::test]
	async fn skips_paths_matched_by_the_ignore_matcher() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("keep.txt"), b"1").unwrap();
		std::fs::create_dir(dir.path().join(".git")).unwrap();
		std::fs::write(dir.path().join(".git").join("HEAD"), b"ref").unwrap();

		let ignore = Arc::new(IgnoreMatcher::new(true, &[], None));
		let (tx, mut rx) = mpsc::channel(8);
		index_project(dir.path().to_path_buf(), ignore, false, tx).await.unwrap();

		let mut paths = Vec::new();
		while let Some(entry) = rx.recv().await {
			paths.push(entry.unwrap().path);
		}
		assert_eq!(paths, vec!["keep.txt".to_string()]);
	}
}

// vim: ts=4
