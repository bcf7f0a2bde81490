//! Primary-side per-connection session (C5, spec.md §4.5).
//!
//! Owns one TLS/TCP stream for its entire lifetime: handshake, then a
//! sequence of at-most-one-at-a-time task runs, each streaming an index
//! and serving block requests over the same connection. The session is
//! not shared across tasks — the controller calls [`Session::run_task`]
//! once per dispatched task and awaits its completion before reusing it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;

use crate::blockstore::BlockStore;
use crate::chunker;
use crate::config::{FRAME_IDLE_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::error::{ProtocolError, SyncdError, TransportError};
use crate::ignore::IgnoreMatcher;
use crate::registry::Registry;
use crate::taskstore::Task;
use crate::tls;
use crate::wire::frame::{self, Message};
use crate::wire::messages::{BlockErrorCode, ControlMessage, TaskReportStatus};

/// Outcome of one completed task run, reported back to the controller.
pub struct TaskOutcome {
	pub status: TaskReportStatus,
	pub error: Option<String>,
	pub bytes_transferred: u64,
	pub files_changed: u64,
	pub files_deleted: u64,
}

/// An authenticated session with one agent, ready to run tasks.
pub struct Session {
	pub node_id: u64,
	pub peer_fingerprint: String,
	reader: ReadHalf<TlsStream<tokio::net::TcpStream>>,
	writer: WriteHalf<TlsStream<tokio::net::TcpStream>>,
}

impl Session {
	/// Runs the handshake (spec.md §4.5 steps 1-4) over an already
	/// TLS-accepted stream, authenticating the agent against `registry`.
	pub async fn handshake(
		tls_stream: TlsStream<tokio::net::TcpStream>,
		registry: &Registry,
		server_fingerprint: &str,
	) -> Result<Session, SyncdError> {
		let peer_der = peer_certificate_der(&tls_stream)?;
		let peer_fingerprint = tls::fingerprint_hex(&peer_der);
		let (mut reader, mut writer) = tokio::io::split(tls_stream);

		let hello = timeout(HANDSHAKE_TIMEOUT, frame::read_message(&mut reader))
			.await
			.map_err(|_| SyncdError::Transport(TransportError::HandshakeTimeout))??;

		let (node_id, token) = match hello.control {
			ControlMessage::Hello { node_id, token, .. } => (node_id, token),
			other => {
				return Err(SyncdError::Protocol(ProtocolError::Malformed {
					message: format!("expected hello, got {:?}", other),
				}))
			}
		};

		if registry.validate_token(node_id, &token).is_err() {
			let ack = ControlMessage::HelloAck {
				ok: false,
				reason: Some("invalid_token".to_string()),
				server_fingerprint: server_fingerprint.to_string(),
			};
			let _ = frame::write_message(&mut writer, &ack, None).await;
			return Err(SyncdError::Authentication { reason: "invalid_token".to_string() });
		}

		if let Err(e) = registry.bind_fingerprint(node_id, &peer_fingerprint) {
			let ack = ControlMessage::HelloAck {
				ok: false,
				reason: Some("fingerprint_mismatch".to_string()),
				server_fingerprint: server_fingerprint.to_string(),
			};
			let _ = frame::write_message(&mut writer, &ack, None).await;
			return Err(e);
		}

		let ack = ControlMessage::HelloAck {
			ok: true,
			reason: None,
			server_fingerprint: server_fingerprint.to_string(),
		};
		frame::write_message(&mut writer, &ack, None).await?;

		Ok(Session { node_id, peer_fingerprint, reader, writer })
	}

	/// Runs one task to completion: sends `task`, streams the index,
	/// serves block requests, and waits for `task_report`.
	pub async fn run_task(
		&mut self,
		task: &Task,
		project_root: &Path,
		ignore: Arc<IgnoreMatcher>,
		blockstore: &BlockStore,
	) -> Result<TaskOutcome, SyncdError> {
		let task_msg = ControlMessage::Task {
			task_id: task.id,
			project_name: task.project_name.clone(),
			target_path: task.payload.target_path.clone(),
			ignore_config: task.payload.ignore_config.clone(),
		};
		frame::write_message(&mut self.writer, &task_msg, None).await?;

		let reply = read_with_idle_timeout(&mut self.reader).await?;
		match reply.control {
			ControlMessage::SyncStart { task_id } if task_id == task.id => {}
			other => {
				return Err(SyncdError::Protocol(ProtocolError::Malformed {
					message: format!("expected sync_start, got {:?}", other),
				}))
			}
		}

		let block_sizes = self.stream_index(task, project_root, &ignore).await?;
		self.serve_blocks_until_report(task, blockstore, &block_sizes).await
	}

	/// Streams the index and returns each indexed path's block size, so
	/// `block_request`s (which carry no `blockSize` of their own, per the
	/// wire table in spec.md §6) can be served correctly afterwards.
	async fn stream_index(
		&mut self,
		task: &Task,
		project_root: &Path,
		ignore: &Arc<IgnoreMatcher>,
	) -> Result<HashMap<String, u32>, SyncdError> {
		let ignore_permissions = task.payload.ignore_config.permissions;
		let (tx, mut rx) = tokio::sync::mpsc::channel(32);
		let walk = chunker::index_project(project_root.to_path_buf(), ignore.clone(), ignore_permissions, tx);
		let walk_handle = tokio::spawn(walk);

		frame::write_message(&mut self.writer, &ControlMessage::IndexBegin { task_id: task.id, file_count: None }, None)
			.await?;

		let mut block_sizes = HashMap::new();
		while let Some(entry) = rx.recv().await {
			let entry = entry?;
			block_sizes.insert(entry.path.clone(), entry.block_size);
			let msg = ControlMessage::IndexFile { task_id: task.id, entry };
			frame::write_message(&mut self.writer, &msg, None).await?;
		}

		walk_handle.await.map_err(|e| SyncdError::Other { message: format!("indexer task panicked: {}", e) })??;

		frame::write_message(&mut self.writer, &ControlMessage::IndexEnd { task_id: task.id }, None).await?;
		Ok(block_sizes)
	}

	async fn serve_blocks_until_report(
		&mut self,
		task: &Task,
		blockstore: &BlockStore,
		block_sizes: &HashMap<String, u32>,
	) -> Result<TaskOutcome, SyncdError> {
		loop {
			let msg = read_with_idle_timeout(&mut self.reader).await?;
			match msg.control {
				ControlMessage::BlockRequest { task_id, path, block } if task_id == task.id => {
					let block_size = match block_sizes.get(&path) {
						Some(bs) => *bs,
						None => {
							let resp = ControlMessage::BlockError {
								task_id,
								path,
								block,
								code: BlockErrorCode::NotFound,
							};
							frame::write_message(&mut self.writer, &resp, None).await?;
							continue;
						}
					};
					match blockstore.read(&path, block, block_size).await {
						Ok(bytes) => {
							let hash = sha256_hex(&bytes);
							let resp = ControlMessage::BlockResponseBin {
								task_id,
								path,
								block,
								size: bytes.len() as u32,
								hash,
							};
							frame::write_message(&mut self.writer, &resp, Some(&bytes)).await?;
						}
						Err(e) => {
							let code = match e {
								crate::error::FilesystemError::NotFound { .. } => BlockErrorCode::NotFound,
								crate::error::FilesystemError::OutOfRange { .. } => BlockErrorCode::OutOfRange,
								_ => BlockErrorCode::Io,
							};
							let resp = ControlMessage::BlockError { task_id, path, block, code };
							frame::write_message(&mut self.writer, &resp, None).await?;
						}
					}
				}
				ControlMessage::TaskReport { task_id, status, error, bytes_transferred, files_changed, files_deleted }
					if task_id == task.id =>
				{
					return Ok(TaskOutcome { status, error, bytes_transferred, files_changed, files_deleted });
				}
				other => {
					return Err(SyncdError::Protocol(ProtocolError::Malformed {
						message: format!("unexpected frame while serving blocks: {:?}", other),
					}))
				}
			}
		}
	}

	/// Instructs the agent to abort the in-flight task (spec.md §4.5 "Cancellation").
	pub async fn cancel_task(&mut self, task_id: u64) -> Result<(), SyncdError> {
		frame::write_message(&mut self.writer, &ControlMessage::TaskCancel { task_id }, None).await
			.map_err(SyncdError::from)
	}

	pub async fn ping(&mut self, nonce: u64) -> Result<(), SyncdError> {
		frame::write_message(&mut self.writer, &ControlMessage::Ping { nonce }, None).await.map_err(SyncdError::from)
	}

	/// Sends a `ping` and waits for its matching `pong` within the
	/// keepalive reply budget (spec.md §4.5 "Keepalive"). Only meaningful
	/// while no task is in flight on this session.
	pub async fn idle_ping(&mut self, nonce: u64) -> Result<(), SyncdError> {
		self.ping(nonce).await?;
		let reply = tokio::time::timeout(crate::config::KEEPALIVE_REPLY_TIMEOUT, frame::read_message(&mut self.reader))
			.await
			.map_err(|_| SyncdError::Transport(TransportError::KeepaliveExhausted))??;
		match reply.control {
			ControlMessage::Pong { nonce: n } if n == nonce => Ok(()),
			other => Err(SyncdError::Protocol(ProtocolError::Malformed {
				message: format!("expected pong, got {:?}", other),
			})),
		}
	}
}

async fn read_with_idle_timeout<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, SyncdError> {
	timeout(FRAME_IDLE_TIMEOUT, frame::read_message(reader))
		.await
		.map_err(|_| SyncdError::Transport(TransportError::IdleTimeout { secs: FRAME_IDLE_TIMEOUT.as_secs() }))?
		.map_err(SyncdError::from)
}

fn peer_certificate_der(stream: &TlsStream<tokio::net::TcpStream>) -> Result<Vec<u8>, SyncdError> {
	let (_, connection) = stream.get_ref();
	let certs = connection
		.peer_certificates()
		.ok_or_else(|| SyncdError::Authentication { reason: "no client certificate presented".to_string() })?;
	let leaf = certs
		.first()
		.ok_or_else(|| SyncdError::Authentication { reason: "empty client certificate chain".to_string() })?;
	Ok(leaf.0.clone())
}

fn sha256_hex(bytes: &[u8]) -> String {
	use sha2::{Digest, Sha256};
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

// vim: ts=4
