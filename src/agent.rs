//! Agent runtime (C6, spec.md §4.6).
//!
//! The mirrored, client-side half of [`crate::session`]: dial the primary,
//! complete the mTLS handshake with fingerprint pinning, then loop reading
//! control frames off the one connection — replying to `ping`, and on
//! `task` reconstructing the indexed tree into `targetPath` by fetching
//! only the blocks that differ from what is already on disk.
//!
//! One [`AgentRuntime`] drives exactly one connection at a time; on any
//! transport failure it reconnects with full-jitter exponential backoff
//! (spec.md §4.5 "Reconnect").

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rustls::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::backoff;
use crate::config::{AgentConfig, FRAME_IDLE_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::error::{ProtocolError, SyncdError, TransportError};
use crate::ignore::IgnoreMatcher;
use crate::logging::*;
use crate::tls::{self, Identity, ServerPin};
use crate::wire::frame::{self, Message};
use crate::wire::messages::{BlockErrorCode, ControlMessage, FileIndexEntry, TaskReportStatus};

/// Reconnect backoff shape (spec.md §4.5): base 1s, factor 2, cap 30s.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Up to this many `block_request`s may be outstanding at once per task
/// (spec.md §4.6 "Concurrency").
const MAX_IN_FLIGHT_BLOCKS: usize = 4;

/// The client side of one agent/primary connection plus its reconnect loop.
pub struct AgentRuntime {
	config: AgentConfig,
	identity: Identity,
	server_pin: ServerPin,
	cancel: CancellationToken,
}

impl AgentRuntime {
	pub fn new(config: AgentConfig) -> Result<Self, SyncdError> {
		let identity = tls::load_or_generate_identity(&config.tls_dir).map_err(SyncdError::from)?;
		let server_pin = ServerPin::new(&config.tls_dir);
		Ok(AgentRuntime { config, identity, server_pin, cancel: CancellationToken::new() })
	}

	/// A token the caller can cancel to stop the reconnect loop after the
	/// current connection (if any) ends.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Runs the connect/authenticate/serve loop until cancelled.
	pub async fn run(&self) -> Result<(), SyncdError> {
		let mut attempt: u32 = 0;
		loop {
			if self.cancel.is_cancelled() {
				return Ok(());
			}
			match self.connect_and_serve().await {
				Ok(()) => {
					info!(node_id = self.config.node_id, "session ended cleanly");
					attempt = 0;
				}
				Err(e) => {
					warn!(node_id = self.config.node_id, error = %e, "session ended with error");
					attempt = attempt.saturating_add(1);
				}
			}
			if self.cancel.is_cancelled() {
				return Ok(());
			}
			let delay = backoff::full_jitter(attempt.max(1), RECONNECT_BASE, RECONNECT_CAP);
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = self.cancel.cancelled() => return Ok(()),
			}
		}
	}

	async fn connect_and_serve(&self) -> Result<(), SyncdError> {
		let tcp = TcpStream::connect(&self.config.primary_addr).await.map_err(SyncdError::from)?;
		let connector = TlsConnector::from(Arc::new(tls::client_config(&self.identity)?));
		let server_name = ServerName::try_from("syncd").map_err(|_| {
			SyncdError::Configuration(crate::error::ConfigError::ParseError {
				message: "invalid TLS server name".to_string(),
			})
		})?;
		let tls_stream = connector.connect(server_name, tcp).await.map_err(SyncdError::from)?;

		let (mut reader, mut writer) = tokio::io::split(tls_stream);
		self.handshake(&mut reader, &mut writer).await?;
		info!(node_id = self.config.node_id, "connected to primary");

		loop {
			let msg = read_with_idle_timeout(&mut reader).await?;
			match msg.control {
				ControlMessage::Ping { nonce } => {
					frame::write_message(&mut writer, &ControlMessage::Pong { nonce }, None).await?;
				}
				ControlMessage::Pong { .. } => {}
				ControlMessage::Task { task_id, project_name, target_path, ignore_config } => {
					let outcome = run_task(
						&mut reader,
						&mut writer,
						task_id,
						&project_name,
						Path::new(&target_path),
						&ignore_config,
					)
					.await;
					let report = match outcome {
						Ok(report) => report,
						Err(e) => TaskReportOutcome {
							status: TaskReportStatus::Failed,
							error: Some(e.to_string()),
							bytes_transferred: 0,
							files_changed: 0,
							files_deleted: 0,
						},
					};
					let msg = ControlMessage::TaskReport {
						task_id,
						status: report.status,
						error: report.error,
						bytes_transferred: report.bytes_transferred,
						files_changed: report.files_changed,
						files_deleted: report.files_deleted,
					};
					frame::write_message(&mut writer, &msg, None).await?;
				}
				other => {
					return Err(SyncdError::Protocol(ProtocolError::Malformed {
						message: format!("unexpected frame while idle: {:?}", other),
					}))
				}
			}
		}
	}

	/// Sends `hello` and validates `hello_ack` (spec.md §4.5 steps 1, 4).
	async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), SyncdError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let hello = ControlMessage::Hello {
			node_id: self.config.node_id,
			token: self.config.token.clone(),
			agent_version: env!("CARGO_PKG_VERSION").to_string(),
			hostname: self.config.hostname.clone(),
		};
		frame::write_message(writer, &hello, None).await?;

		let reply = timeout(HANDSHAKE_TIMEOUT, frame::read_message(reader))
			.await
			.map_err(|_| SyncdError::Transport(TransportError::HandshakeTimeout))??;

		match reply.control {
			ControlMessage::HelloAck { ok: true, server_fingerprint, .. } => {
				self.verify_server_fingerprint(&server_fingerprint)
			}
			ControlMessage::HelloAck { ok: false, reason, .. } => Err(SyncdError::Authentication {
				reason: reason.unwrap_or_else(|| "rejected".to_string()),
			}),
			other => Err(SyncdError::Protocol(ProtocolError::Malformed {
				message: format!("expected hello_ack, got {:?}", other),
			})),
		}
	}

	/// spec.md §4.5 step 4: a statically pinned fingerprint wins; absent
	/// that, fall back to the on-disk TOFU pin.
	fn verify_server_fingerprint(&self, observed: &str) -> Result<(), SyncdError> {
		if let Some(pinned) = &self.config.pinned_server_fingerprint {
			if pinned == observed {
				Ok(())
			} else {
				Err(SyncdError::Authentication { reason: "server fingerprint mismatch".to_string() })
			}
		} else {
			self.server_pin.verify_or_pin(observed).map_err(SyncdError::from)
		}
	}
}

struct TaskReportOutcome {
	status: TaskReportStatus,
	error: Option<String>,
	bytes_transferred: u64,
	files_changed: u64,
	files_deleted: u64,
}

/// Runs one `task` to completion: reads the index, fetches needed blocks,
/// reconstructs files atomically, then deletes anything stale.
async fn run_task<R, W>(
	reader: &mut R,
	writer: &mut W,
	task_id: u64,
	_project_name: &str,
	target_path: &Path,
	ignore_config: &crate::wire::messages::IgnoreConfigWire,
) -> Result<TaskReportOutcome, SyncdError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	frame::write_message(writer, &ControlMessage::SyncStart { task_id }, None).await?;

	let entries = read_index(reader, task_id).await?;
	tokio::fs::create_dir_all(target_path).await?;

	let ignore = IgnoreMatcher::new(ignore_config.defaults, &ignore_config.patterns, None);

	let mut bytes_transferred: u64 = 0;
	let mut files_changed: u64 = 0;

	for entry in &entries {
		if entry.symlink_target.is_some() {
			// Open question (spec.md §9.1): target-side symlink policy is
			// unspecified. Reserve the frame shape, skip materialising.
			continue;
		}
		if entry.dir {
			tokio::fs::create_dir_all(target_path.join(&entry.path)).await?;
			continue;
		}

		match reconstruct_file(reader, writer, task_id, target_path, entry, ignore_config.permissions).await {
			Ok(Some(transferred)) => {
				bytes_transferred += transferred;
				files_changed += 1;
			}
			Ok(None) => {}
			Err(RunError::Cancelled) => {
				frame::write_message(
					writer,
					&ControlMessage::TaskReport {
						task_id,
						status: TaskReportStatus::Cancelled,
						error: None,
						bytes_transferred,
						files_changed,
						files_deleted: 0,
					},
					None,
				)
				.await?;
				return Err(SyncdError::Cancelled);
			}
			Err(RunError::Syncd(e)) => return Err(e),
		}
	}

	let files_deleted = delete_stale_entries(target_path, &entries, &ignore).await?;

	Ok(TaskReportOutcome {
		status: TaskReportStatus::Success,
		error: None,
		bytes_transferred,
		files_changed,
		files_deleted,
	})
}

async fn read_index<R: AsyncRead + Unpin>(reader: &mut R, task_id: u64) -> Result<Vec<FileIndexEntry>, SyncdError> {
	match read_with_idle_timeout(reader).await?.control {
		ControlMessage::IndexBegin { task_id: tid, .. } if tid == task_id => {}
		other => {
			return Err(SyncdError::Protocol(ProtocolError::Malformed {
				message: format!("expected index_begin, got {:?}", other),
			}))
		}
	}

	let mut entries = Vec::new();
	loop {
		match read_with_idle_timeout(reader).await?.control {
			ControlMessage::IndexFile { task_id: tid, entry } if tid == task_id => entries.push(entry),
			ControlMessage::IndexEnd { task_id: tid } if tid == task_id => break,
			other => {
				return Err(SyncdError::Protocol(ProtocolError::Malformed {
					message: format!("unexpected frame while reading index: {:?}", other),
				}))
			}
		}
	}
	Ok(entries)
}

enum RunError {
	Cancelled,
	Syncd(SyncdError),
}

impl From<SyncdError> for RunError {
	fn from(e: SyncdError) -> Self {
		RunError::Syncd(e)
	}
}

/// Diffs one indexed file against disk, fetches whatever blocks differ,
/// and atomically replaces the target via tempfile + rename. Returns
/// `Ok(Some(bytes_fetched))` if anything changed, `Ok(None)` if the file
/// was already identical (spec.md §8 Idempotence property).
async fn reconstruct_file<R, W>(
	reader: &mut R,
	writer: &mut W,
	task_id: u64,
	target_path: &Path,
	entry: &FileIndexEntry,
	ignore_permissions: bool,
) -> Result<Option<u64>, RunError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let dest = target_path.join(&entry.path);
	if let Some(parent) = dest.parent() {
		tokio::fs::create_dir_all(parent).await.map_err(SyncdError::from)?;
	}

	let needed = needed_blocks(&dest, entry).await.map_err(SyncdError::from)?;
	if needed.is_empty() {
		return Ok(None);
	}

	let tmp_path = sibling_tmp_path(&dest);
	prepare_tempfile(&dest, &tmp_path, entry, &needed).await.map_err(SyncdError::from)?;

	let bytes = match fetch_blocks_into(reader, writer, task_id, entry, &needed, &tmp_path).await {
		Ok(bytes) => bytes,
		Err(err) => {
			let _ = tokio::fs::remove_file(&tmp_path).await;
			return Err(err);
		}
	};

	apply_mode(&tmp_path, entry.mode, ignore_permissions).map_err(SyncdError::from)?;
	fsync_and_rename(&tmp_path, &dest).await.map_err(SyncdError::from)?;

	Ok(Some(bytes))
}

/// Block indices whose content differs from what's already on disk (or
/// every block, if the file is missing or its size differs).
async fn needed_blocks(dest: &Path, entry: &FileIndexEntry) -> Result<Vec<u64>, SyncdError> {
	let block_count = FileIndexEntry::expected_block_count(entry.size, entry.block_size) as u64;
	let metadata = tokio::fs::metadata(dest).await.ok();
	let Some(metadata) = metadata else {
		return Ok((0..block_count).collect());
	};
	if metadata.len() != entry.size {
		return Ok((0..block_count).collect());
	}

	let mut file = std::fs::File::open(dest).map_err(|e| {
		SyncdError::Filesystem(crate::error::FilesystemError::Io { path: entry.path.clone(), source: e })
	})?;
	let mut needed = Vec::new();
	for (i, expected_hash) in entry.blocks.iter().enumerate() {
		use std::io::{Read, Seek, SeekFrom};
		let offset = i as u64 * entry.block_size as u64;
		file.seek(SeekFrom::Start(offset)).map_err(|e| {
			SyncdError::Filesystem(crate::error::FilesystemError::Io { path: entry.path.clone(), source: e })
		})?;
		let to_read = std::cmp::min(entry.block_size as u64, entry.size - offset) as usize;
		let mut buf = vec![0u8; to_read];
		file.read_exact(&mut buf).map_err(|e| {
			SyncdError::Filesystem(crate::error::FilesystemError::Io { path: entry.path.clone(), source: e })
		})?;
		use sha2::{Digest, Sha256};
		let mut hasher = Sha256::new();
		hasher.update(&buf);
		let digest: [u8; 32] = hasher.finalize().into();
		if &digest != expected_hash {
			needed.push(i as u64);
		}
	}
	Ok(needed)
}

fn sibling_tmp_path(dest: &Path) -> PathBuf {
	let suffix: u64 = rand::thread_rng().gen();
	let file_name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("file");
	dest.with_file_name(format!(".tmp.{}.{:x}", file_name, suffix))
}

/// Sizes the tempfile to `entry.size` and copies across any block that is
/// *not* in `needed` from the existing target file, so the final rename
/// produces a byte-for-byte-correct file even though only a subset of
/// blocks was re-fetched.
async fn prepare_tempfile(dest: &Path, tmp_path: &Path, entry: &FileIndexEntry, needed: &[u64]) -> Result<(), SyncdError> {
	let needed_set: std::collections::HashSet<u64> = needed.iter().copied().collect();
	let tmp = tokio::fs::File::create(tmp_path).await?;
	tmp.set_len(entry.size).await?;
	drop(tmp);

	if let Ok(mut existing) = std::fs::File::open(dest) {
		use std::io::{Read, Seek, SeekFrom, Write};
		let mut tmp_std = std::fs::OpenOptions::new().write(true).open(tmp_path)?;
		let block_count = FileIndexEntry::expected_block_count(entry.size, entry.block_size) as u64;
		for i in 0..block_count {
			if needed_set.contains(&i) {
				continue;
			}
			let offset = i * entry.block_size as u64;
			let to_read = std::cmp::min(entry.block_size as u64, entry.size - offset) as usize;
			existing.seek(SeekFrom::Start(offset))?;
			let mut buf = vec![0u8; to_read];
			existing.read_exact(&mut buf)?;
			tmp_std.seek(SeekFrom::Start(offset))?;
			tmp_std.write_all(&buf)?;
		}
	}
	Ok(())
}

/// Requests every block in `needed` (pipelined up to
/// [`MAX_IN_FLIGHT_BLOCKS`] outstanding), verifies each against its
/// announced hash/size, and writes it into `tmp_path` at its offset.
async fn fetch_blocks_into<R, W>(
	reader: &mut R,
	writer: &mut W,
	task_id: u64,
	entry: &FileIndexEntry,
	needed: &[u64],
	tmp_path: &Path,
) -> Result<u64, RunError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut tmp = std::fs::OpenOptions::new().write(true).open(tmp_path).map_err(SyncdError::from)?;
	let mut bytes_fetched: u64 = 0;
	let mut queue: std::collections::VecDeque<u64> = needed.iter().copied().collect();
	let mut outstanding = 0usize;

	loop {
		while outstanding < MAX_IN_FLIGHT_BLOCKS {
			match queue.pop_front() {
				Some(block) => {
					let req = ControlMessage::BlockRequest { task_id, path: entry.path.clone(), block };
					frame::write_message(writer, &req, None).await.map_err(SyncdError::from)?;
					outstanding += 1;
				}
				None => break,
			}
		}
		if outstanding == 0 {
			break;
		}

		let msg = read_with_idle_timeout(reader).await?;
		match msg.control {
			ControlMessage::BlockResponseBin { task_id: tid, path, block, size, hash } if tid == task_id && path == entry.path => {
				outstanding -= 1;
				let bytes = msg.binary.ok_or_else(|| {
					SyncdError::Protocol(ProtocolError::MissingBinaryPayload)
				})?;
				if bytes.len() != size as usize {
					return Err(RunError::Syncd(SyncdError::Integrity(crate::error::IntegrityError::SizeMismatch {
						path: entry.path.clone(),
						block,
						expected: size,
						actual: bytes.len(),
					})));
				}
				let actual_hash = sha256_hex(&bytes);
				if actual_hash != hash {
					return Err(RunError::Syncd(SyncdError::Integrity(crate::error::IntegrityError::HashMismatch {
						path: entry.path.clone(),
						block,
						expected: hash,
						actual: actual_hash,
					})));
				}
				use std::io::{Seek, SeekFrom, Write};
				let offset = block * entry.block_size as u64;
				tmp.seek(SeekFrom::Start(offset)).map_err(SyncdError::from)?;
				tmp.write_all(&bytes).map_err(SyncdError::from)?;
				bytes_fetched += bytes.len() as u64;
			}
			ControlMessage::BlockError { task_id: tid, path, block, code } if tid == task_id && path == entry.path => {
				outstanding -= 1;
				return Err(RunError::Syncd(classify_block_error(&path, block, code)));
			}
			ControlMessage::TaskCancel { task_id: tid } if tid == task_id => {
				return Err(RunError::Cancelled);
			}
			other => {
				return Err(RunError::Syncd(SyncdError::Protocol(ProtocolError::Malformed {
					message: format!("unexpected frame while fetching blocks: {:?}", other),
				})))
			}
		}
	}

	tmp.sync_all().map_err(SyncdError::from)?;
	Ok(bytes_fetched)
}

fn classify_block_error(path: &str, block: u64, code: BlockErrorCode) -> SyncdError {
	use crate::error::FilesystemError;
	match code {
		BlockErrorCode::NotFound => SyncdError::Filesystem(FilesystemError::NotFound { path: path.to_string() }),
		BlockErrorCode::OutOfRange => {
			SyncdError::Filesystem(FilesystemError::OutOfRange { path: path.to_string(), block })
		}
		BlockErrorCode::Io => SyncdError::Filesystem(FilesystemError::Io {
			path: path.to_string(),
			source: std::io::Error::new(std::io::ErrorKind::Other, "primary reported I/O error"),
		}),
	}
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32, ignore_permissions: bool) -> std::io::Result<()> {
	if ignore_permissions {
		return Ok(());
	}
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32, _ignore_permissions: bool) -> std::io::Result<()> {
	// Open question (spec.md §9.2): no-op on platforms without POSIX modes.
	Ok(())
}

async fn fsync_and_rename(tmp_path: &Path, dest: &Path) -> std::io::Result<()> {
	let file = tokio::fs::File::open(tmp_path).await?;
	file.sync_all().await?;
	drop(file);
	tokio::fs::rename(tmp_path, dest).await
}

/// Removes anything under `target_path` that isn't named by `entries` and
/// isn't excluded by `ignore` (spec.md §4.6 step 5).
async fn delete_stale_entries(
	target_path: &Path,
	entries: &[FileIndexEntry],
	ignore: &IgnoreMatcher,
) -> Result<u64, SyncdError> {
	let indexed: std::collections::HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();

	let mut stale_files = Vec::new();
	let mut stale_dirs = Vec::new();
	let mut walker = walkdir::WalkDir::new(target_path)
		.min_depth(1)
		.contents_first(false)
		.into_iter();
	while let Some(entry) = walker.next() {
		let entry = match entry {
			Ok(e) => e,
			Err(_) => continue,
		};
		let rel = match entry.path().strip_prefix(target_path) {
			Ok(p) => p.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect::<Vec<_>>().join("/"),
			Err(_) => continue,
		};
		if rel.starts_with(".tmp.") {
			continue;
		}
		let is_dir = entry.file_type().is_dir();
		if ignore.is_ignored(&rel, is_dir) {
			if is_dir {
				walker.skip_current_dir();
			}
			continue;
		}
		if indexed.contains(rel.as_str()) {
			continue;
		}
		if is_dir {
			stale_dirs.push(entry.path().to_path_buf());
		} else {
			stale_files.push(entry.path().to_path_buf());
		}
	}

	let mut deleted = 0u64;
	for path in &stale_files {
		if tokio::fs::remove_file(path).await.is_ok() {
			deleted += 1;
		}
	}
	// Deepest directories first so `remove_dir` never fails on contents
	// that were themselves stale and already removed above.
	stale_dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
	for path in &stale_dirs {
		let _ = tokio::fs::remove_dir(path).await;
	}

	Ok(deleted)
}

fn sha256_hex(bytes: &[u8]) -> String {
	use sha2::{Digest, Sha256};
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

async fn read_with_idle_timeout<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, SyncdError> {
	timeout(FRAME_IDLE_TIMEOUT, frame::read_message(reader))
		.await
		.map_err(|_| SyncdError::Transport(TransportError::IdleTimeout { secs: FRAME_IDLE_TIMEOUT.as_secs() }))?
		.map_err(SyncdError::from)
}


// vim: ts=4
