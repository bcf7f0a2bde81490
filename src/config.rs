//! Configuration types for syncd
//!
//! Configuration follows the teacher's priority chain, narrowed to what the
//! core sync subsystem itself needs (the admin HTTP surface, webhook
//! listener, and git plumbing load their own settings and hand the core
//! only `ProjectSyncConfig` snapshots):
//!
//! 1. Built-in defaults (`Default` impls below)
//! 2. Config file (TOML or JSON5, selected by extension)
//! 3. Environment variables (`SYNCD_*` prefix)
//! 4. CLI flags (highest priority, applied by `main.rs`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default TCP port for the primary's mTLS listener (spec.md §6).
pub const DEFAULT_LISTEN_PORT: u16 = 9001;

/// Handshake timeout (spec.md §5).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-frame read idle timeout (spec.md §5).
pub const FRAME_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-task overall timeout, overridable per project (spec.md §5).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Keepalive reply budget before a session is considered dead (spec.md §4.5).
pub const KEEPALIVE_MISS_LIMIT: u32 = 3;

/// How long to wait for a `pong` after an idle `ping` (spec.md §4.5
/// "the peer replies with pong within 30s").
pub const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the primary process (controller + session listener).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrimaryConfig {
	/// Address the mTLS session listener binds to.
	pub listen_addr: String,

	/// Directory holding the TLS identity, the task/registry redb file,
	/// and any TOFU-pinned fingerprints.
	pub state_dir: PathBuf,

	/// Size of the dispatcher's global worker pool. `None` means
	/// `4 * available_parallelism()`, per spec.md §4.10.
	pub worker_pool_size: Option<usize>,

	/// Maximum attempts before a retried task becomes FAILED_TERMINAL
	/// (spec.md §4.10).
	pub max_attempts: u32,

	/// Statically-configured projects, keyed by project name. In a full
	/// deployment this table is owned by an out-of-scope control plane;
	/// the `syncd primary` binary reads it directly so the core is
	/// runnable standalone (`syncd primary trigger`, tests, demos).
	pub projects: HashMap<String, ProjectConfigFile>,
}

impl Default for PrimaryConfig {
	fn default() -> Self {
		PrimaryConfig {
			listen_addr: format!("0.0.0.0:{}", DEFAULT_LISTEN_PORT),
			state_dir: PathBuf::from("/var/lib/syncd"),
			worker_pool_size: None,
			max_attempts: 5,
			projects: HashMap::new(),
		}
	}
}

/// One project's static configuration as read from the primary's config
/// file: its filesystem root plus the same [`ProjectSyncConfig`] a control
/// plane would otherwise hand the core at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfigFile {
	pub project_root: PathBuf,
	#[serde(flatten)]
	pub sync: ProjectSyncConfig,
}

/// Configuration for the agent process (reconnect loop + reconstruction).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
	/// This agent's node id, as registered in the primary's node registry.
	pub node_id: u64,

	/// Shared secret presented in `hello` (spec.md §4.5).
	pub token: String,

	/// Primary's `host:port` TCP endpoint.
	pub primary_addr: String,

	/// Optional pinned server fingerprint; if absent the agent TOFU-pins
	/// the first one it sees (spec.md §4.5 step 4).
	pub pinned_server_fingerprint: Option<String>,

	/// Directory holding this agent's TLS identity and trust store.
	pub tls_dir: PathBuf,

	/// Interval between heartbeat `RecordHeartbeat` calls to the registry.
	#[serde(with = "duration_secs")]
	pub heartbeat_interval: Duration,

	/// Local hostname reported in `hello`.
	pub hostname: String,
}

impl Default for AgentConfig {
	fn default() -> Self {
		AgentConfig {
			node_id: 0,
			token: String::new(),
			primary_addr: format!("127.0.0.1:{}", DEFAULT_LISTEN_PORT),
			pinned_server_fingerprint: None,
			tls_dir: PathBuf::from("/var/lib/syncd-agent/tls"),
			heartbeat_interval: Duration::from_secs(30),
			hostname: hostname_or_unknown(),
		}
	}
}

fn hostname_or_unknown() -> String {
	std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

mod duration_secs {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		d.as_secs().serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}

/// A single node a project syncs to (spec.md §3 `ProjectSyncConfig.nodes[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSyncTarget {
	pub node_id: u64,
	/// Absolute path on the agent to materialise the tree into.
	pub target_path: String,
	#[serde(default)]
	pub include: Vec<String>,
	#[serde(default)]
	pub exclude: Vec<String>,
}

/// Per-project sync configuration (spec.md §3 `ProjectSyncConfig`), owned
/// by the control plane and handed to the core read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectSyncConfig {
	pub enabled: bool,
	pub max_parallel_nodes: usize,
	pub ignore_defaults: bool,
	pub ignore_patterns: Vec<String>,
	pub ignore_file: Option<String>,
	pub ignore_permissions: bool,
	pub nodes: Vec<NodeSyncTarget>,
	/// Per-project override of `DEFAULT_TASK_TIMEOUT` (spec.md §5).
	#[serde(with = "duration_secs")]
	pub task_timeout: Duration,
}

impl Default for ProjectSyncConfig {
	fn default() -> Self {
		ProjectSyncConfig {
			enabled: false,
			max_parallel_nodes: 1,
			ignore_defaults: true,
			ignore_patterns: Vec::new(),
			ignore_file: None,
			ignore_permissions: false,
			nodes: Vec::new(),
			task_timeout: DEFAULT_TASK_TIMEOUT,
		}
	}
}

impl ProjectSyncConfig {
	pub fn validate(&self, project_name: &str) -> Result<(), ConfigError> {
		if self.max_parallel_nodes == 0 {
			return Err(ConfigError::ParseError {
				message: format!("{}: maxParallelNodes must be >= 1", project_name),
			});
		}
		for node in &self.nodes {
			if !node.target_path.starts_with('/') {
				return Err(ConfigError::InvalidTargetPath { path: node.target_path.clone() });
			}
		}
		Ok(())
	}
}

/// Load a `PrimaryConfig` from an optional file (TOML or JSON5 by
/// extension), falling back to defaults, then overridden from `SYNCD_*`
/// environment variables.
pub fn load_primary_config(path: Option<&Path>) -> Result<PrimaryConfig, ConfigError> {
	let mut cfg = match path {
		Some(p) => load_from_file(p)?,
		None => PrimaryConfig::default(),
	};
	if let Ok(addr) = std::env::var("SYNCD_LISTEN_ADDR") {
		cfg.listen_addr = addr;
	}
	if let Ok(dir) = std::env::var("SYNCD_STATE_DIR") {
		cfg.state_dir = PathBuf::from(dir);
	}
	Ok(cfg)
}

fn load_from_file(path: &Path) -> Result<PrimaryConfig, ConfigError> {
	let text = std::fs::read_to_string(path)
		.map_err(|e| ConfigError::ParseError { message: format!("{}: {}", path.display(), e) })?;
	match path.extension().and_then(|e| e.to_str()) {
		Some("json5") | Some("json") => json5::from_str(&text)
			.map_err(|e| ConfigError::ParseError { message: e.to_string() }),
		_ => toml::from_str(&text).map_err(|e| ConfigError::ParseError { message: e.to_string() }),
	}
}


// vim: ts=4
