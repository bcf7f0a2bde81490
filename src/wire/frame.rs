//! Length-prefixed frame codec (spec.md §4.4).
//!
//! The TLS byte stream carries two kinds of frames, both length-prefixed
//! with a 4-byte big-endian length:
//!
//! - JSON frames: one `ControlMessage` per frame, capped at 1 MiB.
//! - Binary frames: raw block bytes, capped at `MAX_BLOCK_SIZE + 64`.
//!
//! A `block_response_bin` control message is always immediately followed
//! by the binary frame carrying the block's bytes — `read_message` and
//! `write_message` enforce that pairing so callers never see the two
//! halves drift apart.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::wire::messages::ControlMessage;

/// Maximum encoded length of a single JSON control frame.
pub const MAX_JSON_FRAME_LEN: u32 = 1024 * 1024;

/// Maximum block size the chunker ever produces (2^22, spec.md §4.1).
pub const MAX_BLOCK_SIZE: u32 = 1 << 22;

/// Maximum length of a binary frame: the largest possible block plus
/// slack for framing overhead.
const MAX_BINARY_FRAME_LEN: u32 = MAX_BLOCK_SIZE + 64;

/// A control message, optionally paired with the binary payload that
/// immediately followed it on the wire.
#[derive(Debug)]
pub struct Message {
	pub control: ControlMessage,
	pub binary: Option<Vec<u8>>,
}

async fn read_len_prefixed<R: AsyncRead + Unpin>(
	reader: &mut R,
	max_len: u32,
) -> Result<Vec<u8>, ProtocolError> {
	let mut len_buf = [0u8; 4];
	reader.read_exact(&mut len_buf).await.map_err(|e| ProtocolError::Malformed {
		message: format!("reading frame length: {}", e),
	})?;
	let len = u32::from_be_bytes(len_buf);
	if len > max_len {
		return Err(ProtocolError::FrameTooLarge { len, max: max_len });
	}
	let mut payload = vec![0u8; len as usize];
	reader.read_exact(&mut payload).await.map_err(|e| ProtocolError::Malformed {
		message: format!("reading frame payload: {}", e),
	})?;
	Ok(payload)
}

async fn write_len_prefixed<W: AsyncWrite + Unpin>(
	writer: &mut W,
	payload: &[u8],
) -> Result<(), ProtocolError> {
	let len: u32 = payload.len().try_into().map_err(|_| ProtocolError::FrameTooLarge {
		len: u32::MAX,
		max: MAX_BINARY_FRAME_LEN,
	})?;
	writer.write_all(&len.to_be_bytes()).await.map_err(|e| ProtocolError::Malformed {
		message: format!("writing frame length: {}", e),
	})?;
	writer.write_all(payload).await.map_err(|e| ProtocolError::Malformed {
		message: format!("writing frame payload: {}", e),
	})?;
	Ok(())
}

/// Read one logical message: a JSON control frame, plus its paired binary
/// frame if the control message is a `block_response_bin`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
	let json_payload = read_len_prefixed(reader, MAX_JSON_FRAME_LEN).await?;
	let control: ControlMessage = serde_json::from_slice(&json_payload)?;

	let binary = if control.expects_binary_payload() {
		Some(read_len_prefixed(reader, MAX_BINARY_FRAME_LEN).await?)
	} else {
		None
	};

	Ok(Message { control, binary })
}

/// Write one logical message. `binary` must be `Some` iff `control`
/// expects a binary payload (`ControlMessage::expects_binary_payload`);
/// mismatches are a caller bug and panic rather than silently desyncing
/// the stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
	writer: &mut W,
	control: &ControlMessage,
	binary: Option<&[u8]>,
) -> Result<(), ProtocolError> {
	assert_eq!(
		control.expects_binary_payload(),
		binary.is_some(),
		"binary payload presence must match control message kind"
	);

	let json_payload = serde_json::to_vec(control)?;
	write_len_prefixed(writer, &json_payload).await?;
	if let Some(bytes) = binary {
		write_len_prefixed(writer, bytes).await?;
	}
	writer.flush().await.map_err(|e| ProtocolError::Malformed {
		message: format!("flushing frame: {}", e),
	})?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::messages::{BlockErrorCode, TaskReportStatus};
	use std::io::Cursor;

	#[tokio::test]
	async fn round_trips_a_plain_control_message() {
		let msg = ControlMessage::Ping { nonce: 42 };
		let mut buf = Vec::new();
		write_message(&mut buf, &msg, None).await.unwrap();

		let mut cursor = Cursor::new(buf);
		let read = read_message(&mut cursor).await.unwrap();
		assert!(read.binary.is_none());
		match read.control {
			ControlMessage::Ping { nonce } => assert_eq!(nonce, 42),
			_ => panic!("wrong variant"),
		}
	}

	#[tokio::test]
	async fn pairs_block_response_bin_with_its_binary_frame() {
		let msg = ControlMessage::BlockResponseBin {
			task_id: 1,
			path: "a.bin".to_string(),
			block: 0,
			size: 5,
			hash: "deadbeef".to_string(),
		};
		let payload = b"hello".to_vec();
		let mut buf = Vec::new();
		write_message(&mut buf, &msg, Some(&payload)).await.unwrap();

		let mut cursor = Cursor::new(buf);
		let read = read_message(&mut cursor).await.unwrap();
		assert_eq!(read.binary.as_deref(), Some(payload.as_slice()));
	}

	#[tokio::test]
	async fn rejects_json_frame_over_the_cap() {
		let mut buf = Vec::new();
		let oversized_len = (MAX_JSON_FRAME_LEN + 1).to_be_bytes();
		buf.extend_from_slice(&oversized_len);
		let mut cursor = Cursor::new(buf);
		let err = read_message(&mut cursor).await.unwrap_err();
		match err {
			ProtocolError::FrameTooLarge { max, .. } => assert_eq!(max, MAX_JSON_FRAME_LEN),
			other => panic!("expected FrameTooLarge, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn block_error_carries_no_binary_payload() {
		let msg = ControlMessage::BlockError {
			task_id: 1,
			path: "a.bin".to_string(),
			block: 0,
			code: BlockErrorCode::NotFound,
		};
		let mut buf = Vec::new();
		write_message(&mut buf, &msg, None).await.unwrap();
		let mut cursor = Cursor::new(buf);
		let read = read_message(&mut cursor).await.unwrap();
		assert!(read.binary.is_none());
	}

	#[tokio::test]
	async fn task_report_round_trips() {
		let msg = ControlMessage::TaskReport {
			task_id: 9,
			status: TaskReportStatus::Success,
			error: None,
			bytes_transferred: 1024,
			files_changed: 3,
			files_deleted: 0,
		};
		let mut buf = Vec::new();
		write_message(&mut buf, &msg, None).await.unwrap();
		let mut cursor = Cursor::new(buf);
		let read = read_message(&mut cursor).await.unwrap();
		match read.control {
			ControlMessage::TaskReport { task_id, status: TaskReportStatus::Success, .. } => {
				assert_eq!(task_id, 9)
			}
			other => panic!("unexpected: {:?}", other),
		}
	}
}

// vim: ts=4
