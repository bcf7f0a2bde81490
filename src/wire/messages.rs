//! Control message types exchanged as JSON frames (spec.md §6).
//!
//! Every control frame is a JSON object with a required `type` field; we
//! model that with an internally-tagged enum so each variant's payload
//! fields sit alongside `type` exactly as the wire table in spec.md §6
//! describes, rather than nested under a `data` key.

use serde::{Deserialize, Serialize};

/// A 32-byte SHA-256 digest, hex-encoded on the wire.
pub type BlockHash = [u8; 32];

/// One entry of the index stream (spec.md §3 `FileIndexEntry`, §6 `index_file`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
	/// POSIX-slash path relative to the project root.
	pub path: String,
	pub size: u64,
	/// Unix nanoseconds.
	pub mtime: i64,
	/// POSIX permission bits (masked to 16 bits).
	pub mode: u32,
	pub block_size: u32,
	#[serde(with = "hex_blocks")]
	pub blocks: Vec<BlockHash>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub dir: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub symlink_target: Option<String>,
}

impl FileIndexEntry {
	/// Number of blocks a file of `size` bytes must have, per spec.md §3.
	pub fn expected_block_count(size: u64, block_size: u32) -> usize {
		if size == 0 {
			0
		} else {
			((size + block_size as u64 - 1) / block_size as u64) as usize
		}
	}
}

mod hex_blocks {
	use super::BlockHash;
	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(blocks: &[BlockHash], s: S) -> Result<S::Ok, S::Error> {
		let hexed: Vec<String> = blocks.iter().map(hex::encode).collect();
		hexed.serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<BlockHash>, D::Error> {
		let hexed: Vec<String> = Vec::deserialize(d)?;
		hexed
			.into_iter()
			.map(|h| {
				let bytes = hex::decode(&h).map_err(serde::de::Error::custom)?;
				let arr: BlockHash = bytes
					.as_slice()
					.try_into()
					.map_err(|_| serde::de::Error::custom("block hash must be 32 bytes"))?;
				Ok(arr)
			})
			.collect()
	}
}

/// Ignore configuration snapshot carried in a `task` frame (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreConfigWire {
	pub defaults: bool,
	pub patterns: Vec<String>,
	pub permissions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockErrorCode {
	NotFound,
	Io,
	OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskReportStatus {
	Success,
	Failed,
	Cancelled,
}

/// All control frames exchanged between primary (P) and agent (A),
/// per the wire table in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
	/// A -> P
	#[serde(rename = "hello")]
	Hello { node_id: u64, token: String, agent_version: String, hostname: String },

	/// P -> A
	#[serde(rename = "hello_ack")]
	HelloAck {
		ok: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
		server_fingerprint: String,
	},

	/// either direction
	#[serde(rename = "ping")]
	Ping { nonce: u64 },

	/// either direction
	#[serde(rename = "pong")]
	Pong { nonce: u64 },

	/// P -> A
	#[serde(rename = "task")]
	Task {
		task_id: u64,
		project_name: String,
		target_path: String,
		ignore_config: IgnoreConfigWire,
	},

	/// A -> P
	#[serde(rename = "sync_start")]
	SyncStart { task_id: u64 },

	/// P -> A
	#[serde(rename = "index_begin")]
	IndexBegin {
		task_id: u64,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		file_count: Option<u64>,
	},

	/// P -> A
	#[serde(rename = "index_file")]
	IndexFile {
		task_id: u64,
		#[serde(flatten)]
		entry: FileIndexEntry,
	},

	/// P -> A
	#[serde(rename = "index_end")]
	IndexEnd { task_id: u64 },

	/// A -> P
	#[serde(rename = "block_request")]
	BlockRequest { task_id: u64, path: String, block: u64 },

	/// P -> A, immediately followed by the raw binary frame.
	#[serde(rename = "block_response_bin")]
	BlockResponseBin { task_id: u64, path: String, block: u64, size: u32, hash: String },

	/// P -> A
	#[serde(rename = "block_error")]
	BlockError { task_id: u64, path: String, block: u64, code: BlockErrorCode },

	/// P -> A
	#[serde(rename = "task_cancel")]
	TaskCancel { task_id: u64 },

	/// A -> P
	#[serde(rename = "task_report")]
	TaskReport {
		task_id: u64,
		status: TaskReportStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
		bytes_transferred: u64,
		files_changed: u64,
		files_deleted: u64,
	},
}

impl ControlMessage {
	/// Whether this message kind is always immediately followed by a raw
	/// binary frame (spec.md §4.4 ordering rule — the only such pairing).
	pub fn expects_binary_payload(&self) -> bool {
		matches!(self, ControlMessage::BlockResponseBin { .. })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hello_round_trips_through_json() {
		let msg = ControlMessage::Hello {
			node_id: 7,
			token: "secret".to_string(),
			agent_version: "0.1.0".to_string(),
			hostname: "agent-1".to_string(),
		};
		let json = serde_json::to_string(&msg).unwrap();
		assert!(json.contains("\"type\":\"hello\""));
		let back: ControlMessage = serde_json::from_str(&json).unwrap();
		match back {
			ControlMessage::Hello { node_id, .. } => assert_eq!(node_id, 7),
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn index_file_flattens_entry_fields() {
		let entry = FileIndexEntry {
			path: "a.txt".to_string(),
			size: 4,
			mtime: 0,
			mode: 0o644,
			block_size: 131072,
			blocks: vec![[7u8; 32]],
			dir: false,
			symlink_target: None,
		};
		let msg = ControlMessage::IndexFile { task_id: 1, entry: entry.clone() };
		let json = serde_json::to_string(&msg).unwrap();
		let value: serde_json::Value = serde_json::from_str(&json).unwrap();
		assert_eq!(value["path"], "a.txt");
		assert_eq!(value["taskId"], 1);
		assert!(!value.as_object().unwrap().contains_key("dir"));

		let back: ControlMessage = serde_json::from_str(&json).unwrap();
		match back {
			ControlMessage::IndexFile { task_id, entry: e } => {
				assert_eq!(task_id, 1);
				assert_eq!(e, entry);
			}
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn block_response_bin_expects_binary_payload() {
		let msg = ControlMessage::BlockResponseBin {
			task_id: 1,
			path: "a".to_string(),
			block: 0,
			size: 10,
			hash: "aa".to_string(),
		};
		assert!(msg.expects_binary_payload());
		let other = ControlMessage::TaskCancel { task_id: 1 };
		assert!(!other.expects_binary_payload());
	}
}

// vim: ts=4
