//! Durable node registry (C7, spec.md §4.7).
//!
//! The registry is the sole source of truth for authentication material on
//! the primary: tokens, pinned agent certificate fingerprints, and health.
//! Keyed by `redb`, the same embedded store the task queue uses, mirroring
//! the teacher's `cache.rs` table-per-concern layout: values are bincode
//! behind a schema-version byte (see [`crate::durable`]), not raw JSON.

use std::path::Path;

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::durable;
use crate::error::{ConfigError, SyncdError};

const NODES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
	Online,
	Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
	Healthy,
	Degraded,
	Unknown,
}

/// A node as persisted by the registry (spec.md §3 `Node`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
	pub id: u64,
	pub name: String,
	pub address: String,
	pub token: String,
	pub agent_cert_fingerprint: Option<String>,
	pub status: NodeStatus,
	pub health: NodeHealth,
	/// Unix milliseconds.
	pub last_seen: Option<i64>,
	pub agent_version: String,
}

/// Raised by [`Registry::validate_token`] on a bad or unknown token.
#[derive(Debug)]
pub struct InvalidToken;

pub struct Registry {
	db: redb::Database,
}

impl Registry {
	/// Opens (creating if absent) the registry's `redb` table at `path`.
	pub fn open(path: &Path) -> Result<Self, SyncdError> {
		let db = redb::Database::create(path).map_err(|e| SyncdError::Other { message: e.to_string() })?;
		{
			let write_txn = db.begin_write().map_err(|e| SyncdError::Other { message: e.to_string() })?;
			let _ = write_txn.open_table(NODES_TABLE).map_err(|e| SyncdError::Other { message: e.to_string() })?;
			write_txn.commit().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		}
		Ok(Registry { db })
	}

	/// Creates or overwrites a node record in full — the control-plane CRUD
	/// entry point (spec.md §4.7 "Provides CRUD on Node").
	pub fn put(&self, node: &Node) -> Result<(), SyncdError> {
		self.write(node.id, node)
	}

	pub fn get(&self, node_id: u64) -> Result<Option<Node>, SyncdError> {
		let read_txn = self.db.begin_read().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		let table = read_txn.open_table(NODES_TABLE).map_err(|e| SyncdError::Other { message: e.to_string() })?;
		match table.get(node_id).map_err(|e| SyncdError::Other { message: e.to_string() })? {
			Some(value) => {
				let node: Node = durable::decode(value.value())?;
				Ok(Some(node))
			}
			None => Ok(None),
		}
	}

	pub fn delete(&self, node_id: u64) -> Result<(), SyncdError> {
		let write_txn = self.db.begin_write().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		{
			let mut table = write_txn.open_table(NODES_TABLE).map_err(|e| SyncdError::Other { message: e.to_string() })?;
			table.remove(node_id).map_err(|e| SyncdError::Other { message: e.to_string() })?;
		}
		write_txn.commit().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		Ok(())
	}

	/// `ValidateToken(nodeId, presentedToken) -> Node | ErrInvalidToken`,
	/// compared in constant time so a timing side-channel cannot leak how
	/// many leading bytes of the token matched.
	pub fn validate_token(&self, node_id: u64, presented: &str) -> Result<Node, InvalidToken> {
		let node = self.get(node_id).ok().flatten().ok_or(InvalidToken)?;
		if node.token.as_bytes().ct_eq(presented.as_bytes()).into() {
			Ok(node)
		} else {
			Err(InvalidToken)
		}
	}

	/// `BindFingerprint(nodeId, fp) -> error` — TOFU: sets only when the
	/// previous value was empty; a differing fingerprint is a hard
	/// authentication failure (spec.md §3 invariant 1, §4.7).
	pub fn bind_fingerprint(&self, node_id: u64, fingerprint: &str) -> Result<(), SyncdError> {
		let mut node = self
			.get(node_id)?
			.ok_or_else(|| SyncdError::Configuration(ConfigError::UnknownProject { name: node_id.to_string() }))?;

		match &node.agent_cert_fingerprint {
			None => {
				node.agent_cert_fingerprint = Some(fingerprint.to_string());
				self.write(node_id, &node)
			}
			Some(existing) if existing == fingerprint => Ok(()),
			Some(_) => Err(SyncdError::Authentication {
				reason: format!("fingerprint_mismatch for node {}", node_id),
			}),
		}
	}

	/// `RotateToken(nodeId) -> newToken`. Any session currently relying on
	/// the old token becomes invalid; it is C5's job to notice and drop it
	/// on the next handshake or heartbeat check.
	pub fn rotate_token(&self, node_id: u64, new_token: String) -> Result<(), SyncdError> {
		let mut node = self
			.get(node_id)?
			.ok_or_else(|| SyncdError::Configuration(ConfigError::UnknownProject { name: node_id.to_string() }))?;
		node.token = new_token;
		self.write(node_id, &node)
	}

	/// `RecordHeartbeat(nodeId, status, health, agentVersion, hostname)`.
	/// `hostname` updates `address` as a connectivity hint only — it is
	/// never authoritative (spec.md §3 `Node.address` is "hint only").
	pub fn record_heartbeat(
		&self,
		node_id: u64,
		status: NodeStatus,
		health: NodeHealth,
		agent_version: &str,
		hostname: &str,
		now_millis: i64,
	) -> Result<(), SyncdError> {
		let mut node = self
			.get(node_id)?
			.ok_or_else(|| SyncdError::Configuration(ConfigError::UnknownProject { name: node_id.to_string() }))?;
		node.status = status;
		node.health = health;
		node.agent_version = agent_version.to_string();
		node.address = hostname.to_string();
		node.last_seen = Some(now_millis);
		self.write(node_id, &node)
	}

	fn write(&self, node_id: u64, node: &Node) -> Result<(), SyncdError> {
		let bytes = durable::encode(node)?;
		let write_txn = self.db.begin_write().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		{
			let mut table = write_txn.open_table(NODES_TABLE).map_err(|e| SyncdError::Other { message: e.to_string() })?;
			table.insert(node_id, bytes.as_slice()).map_err(|e| SyncdError::Other { message: e.to_string() })?;
		}
		write_txn.commit().map_err(|e| SyncdError::Other { message: e.to_string() })?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_node(id: u64) -> Node {
		Node {
			id,
			name: format!("node-{}", id),
			address: "10.0.0.1".to_string(),
			token: "supersecrettoken".to_string(),
			agent_cert_fingerprint: None,
			status: NodeStatus::Offline,
			health: NodeHealth::Unknown,
			last_seen: None,
			agent_version: "0.0.0".to_string(),
		}
	}

	#[test]
	fn round_trips_a_node_record() {
		let dir = tempfile::tempdir().unwrap();
		let registry = Registry::open(&dir.path().join("registry.redb")).unwrap();
		registry.put(&sample_node(1)).unwrap();
		let fetched = registry.get(1).unwrap().unwrap();
		assert_eq!(fetched.name, "node-1");
	}

	#[test]
	fn validates_a_correct_token() {
		let dir = tempfile::tempdir().unwrap();
		let registry = Registry::open(&dir.path().join("registry.redb")).unwrap();
		registry.put(&sample_node(1)).unwrap();
		assert!(registry.validate_token(1, "supersecrettoken").is_ok());
		assert!(registry.validate_token(1, "wrong").is_err());
	}

	#[test]
	fn binds_fingerprint_on_first_use_then_rejects_a_change() {
		let dir = tempfile::tempdir().unwrap();
		let registry = Registry::open(&dir.path().join("registry.redb")).unwrap();
		registry.put(&sample_node(1)).unwrap();

		registry.bind_fingerprint(1, "fp1").unwrap();
		let node = registry.get(1).unwrap().unwrap();
		assert_eq!(node.agent_cert_fingerprint.as_deref(), Some("fp1"));

		// Same fingerprint again: fine.
		registry.bind_fingerprint(1, "fp1").unwrap();

		// Different fingerprint: authentication failure.
		let err = registry.bind_fingerprint(1, "fp2").unwrap_err();
		assert!(matches!(err, SyncdError::Authentication { .. }));
	}

	#[test]
	fn rotate_token_replaces_the_stored_secret() {
		let dir = tempfile::tempdir().unwrap();
		let registry = Registry::open(&dir.path().join("registry.redb")).unwrap();
		registry.put(&sample_node(1)).unwrap();
		registry.rotate_token(1, "newtoken".to_string()).unwrap();
		assert!(registry.validate_token(1, "supersecrettoken").is_err());
		assert!(registry.validate_token(1, "newtoken").is_ok());
	}

	#[test]
	fn record_heartbeat_updates_status_and_last_seen() {
		let dir = tempfile::tempdir().unwrap();
		let registry = Registry::open(&dir.path().join("registry.redb")).unwrap();
		registry.put(&sample_node(1)).unwrap();
		registry
			.record_heartbeat(1, NodeStatus::Online, NodeHealth::Healthy, "1.2.3", "agent-host", 1_700_000_000_000)
			.unwrap();
		let node = registry.get(1).unwrap().unwrap();
		assert_eq!(node.status, NodeStatus::Online);
		assert_eq!(node.last_seen, Some(1_700_000_000_000));
	}
}

// vim: ts=4
