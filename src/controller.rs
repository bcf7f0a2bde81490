//! Sync Controller (C10, spec.md §4.10) and the session pool that backs it.
//!
//! The controller is the primary-side orchestrator: `TriggerSync` turns an
//! external event into one task per configured node (spec.md §4.10 "On
//! TriggerSync"), and a cooperative worker pool claims tasks from [`crate::taskstore`],
//! borrows an authenticated session for the task's node from the
//! [`SessionPool`], runs it, and feeds the outcome back into both the task
//! store and the node registry's health tracking.
//!
//! Sessions are inbound: agents dial the primary (spec.md §4.5), so the
//! pool doesn't open connections — it accepts them, and workers wait for
//! one to become available for the node they need.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::backoff;
use crate::blockstore::BlockStore;
use crate::config::{self, KEEPALIVE_MISS_LIMIT, PrimaryConfig};
use crate::error::SyncdError;
use crate::ignore::IgnoreMatcher;
use crate::logging::*;
use crate::registry::{NodeHealth, NodeStatus, Registry};
use crate::session::Session;
use crate::taskstore::{Task, TaskPayload, TaskState, TaskStore};
use crate::tls::{self, Identity};
use crate::wire::messages::IgnoreConfigWire;

/// Maximum retry attempts before a task is left in its terminal `Failed`
/// state (spec.md §4.10 "Retry policy").
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry backoff shape (spec.md §4.10): `min(30s * 2^(attempt-1), 10min)`.
const RETRY_BASE: Duration = Duration::from_secs(30);
const RETRY_CAP: Duration = Duration::from_secs(10 * 60);

/// `Display` prefix of [`SyncdError::Integrity`], the only signal the
/// controller has for classifying a stringified [`Task::last_error`].
const INTEGRITY_ERROR_PREFIX: &str = "integrity error:";

/// Interval between idle keepalive pings on a session sitting in the pool.
const IDLE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Interval a dispatcher worker waits before re-polling an empty queue.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A project's sync configuration plus the filesystem root it describes,
/// as the (out-of-scope) control plane would hand it to the core.
#[derive(Debug, Clone)]
pub struct ProjectConfigEntry {
	pub project_root: PathBuf,
	pub config: config::ProjectSyncConfig,
}

/// How the controller discovers a project's current sync configuration.
/// Implemented by the (out-of-scope) control plane; a simple in-memory
/// version is provided for embedding and tests. `async` because a real
/// control plane typically answers this from a database or another service.
#[async_trait]
pub trait ProjectConfigSource: Send + Sync {
	async fn load(&self, project_name: &str) -> Option<ProjectConfigEntry>;
}

/// An in-memory [`ProjectConfigSource`], useful for tests and for the
/// `syncd primary trigger` debug subcommand.
#[derive(Default)]
pub struct InMemoryProjectConfigSource {
	projects: std::sync::RwLock<HashMap<String, ProjectConfigEntry>>,
}

impl InMemoryProjectConfigSource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, project_name: impl Into<String>, entry: ProjectConfigEntry) {
		self.projects.write().expect("config source lock poisoned").insert(project_name.into(), entry);
	}
}

#[async_trait]
impl ProjectConfigSource for InMemoryProjectConfigSource {
	async fn load(&self, project_name: &str) -> Option<ProjectConfigEntry> {
		self.projects.read().expect("config source lock poisoned").get(project_name).cloned()
	}
}

fn now_millis() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Holds every currently-authenticated agent session, keyed by `nodeId`.
/// Workers "borrow" a session for the duration of one task; agents insert
/// themselves on successful handshake and are removed on any I/O error.
pub struct SessionPool {
	sessions: Mutex<HashMap<u64, Arc<Mutex<Session>>>>,
	notify: Notify,
}

impl SessionPool {
	pub fn new() -> Arc<Self> {
		Arc::new(SessionPool { sessions: Mutex::new(HashMap::new()), notify: Notify::new() })
	}

	async fn insert(&self, node_id: u64, session: Session) {
		let mut sessions = self.sessions.lock().await;
		sessions.insert(node_id, Arc::new(Mutex::new(session)));
		self.notify.notify_waiters();
	}

	async fn remove(&self, node_id: u64) {
		self.sessions.lock().await.remove(&node_id);
	}

	/// Returns the handle for `node_id` if a session is currently
	/// connected, without waiting.
	async fn get(&self, node_id: u64) -> Option<Arc<Mutex<Session>>> {
		self.sessions.lock().await.get(&node_id).cloned()
	}

	/// Waits until a session for `node_id` is connected, then returns a
	/// handle to it. Multiple callers may observe the same handle; the
	/// session's own mutex is what actually serialises task execution.
	async fn wait_for(&self, node_id: u64, cancel: &CancellationToken) -> Option<Arc<Mutex<Session>>> {
		loop {
			if let Some(handle) = self.get(node_id).await {
				return Some(handle);
			}
			tokio::select! {
				_ = self.notify.notified() => {}
				_ = cancel.cancelled() => return None,
			}
		}
	}

	pub async fn is_connected(&self, node_id: u64) -> bool {
		self.sessions.lock().await.contains_key(&node_id)
	}
}

/// Accepts inbound mTLS connections from agents and populates a
/// [`SessionPool`], handshaking each one against the node registry
/// (spec.md §4.5).
pub struct Listener {
	listener: TcpListener,
	acceptor: TlsAcceptor,
	identity: Arc<Identity>,
	registry: Arc<Registry>,
	pool: Arc<SessionPool>,
}

impl Listener {
	pub async fn bind(addr: &str, identity: Arc<Identity>, registry: Arc<Registry>, pool: Arc<SessionPool>) -> Result<Self, SyncdError> {
		let listener = TcpListener::bind(addr).await.map_err(SyncdError::from)?;
		let server_config = tls::server_config(&identity)?;
		let acceptor = TlsAcceptor::from(Arc::new(server_config));
		Ok(Listener { listener, acceptor, identity, registry, pool })
	}

	/// The address actually bound, useful when `bind`'s `addr` asked for an
	/// ephemeral port.
	pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
		self.listener.local_addr()
	}

	/// Runs the accept loop until `cancel` fires. Each connection is
	/// handshaked on its own task so one slow/malicious peer can't block
	/// others.
	pub async fn serve(&self, cancel: CancellationToken) -> Result<(), SyncdError> {
		let server_fingerprint = self.identity.fingerprint();
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				accepted = self.listener.accept() => {
					let (tcp, peer_addr) = accepted.map_err(SyncdError::from)?;
					let acceptor = self.acceptor.clone();
					let registry = self.registry.clone();
					let pool = self.pool.clone();
					let server_fingerprint = server_fingerprint.clone();
					let cancel = cancel.clone();
					tokio::spawn(async move {
						match accept_one(acceptor, tcp, &registry, &server_fingerprint).await {
							Ok(session) => {
								let node_id = session.node_id;
								info!(node_id = node_id, peer_addr = %peer_addr, "agent session established");
								pool.insert(node_id, session).await;
								spawn_idle_keepalive(node_id, pool, registry, cancel);
							}
							Err(e) => warn!(peer_addr = %peer_addr, error = %e, "agent handshake failed"),
						}
					});
				}
			}
		}
	}
}

async fn accept_one(
	acceptor: TlsAcceptor,
	tcp: tokio::net::TcpStream,
	registry: &Registry,
	server_fingerprint: &str,
) -> Result<Session, SyncdError> {
	let tls_stream = acceptor.accept(tcp).await.map_err(SyncdError::from)?;
	Session::handshake(tls_stream, registry, server_fingerprint).await
}

/// Updates a node's status/health without disturbing its recorded
/// `agentVersion`/`address`, which this layer doesn't know — those are
/// only refreshed by the agent's own heartbeat loop.
fn update_node_health(registry: &Registry, node_id: u64, status: NodeStatus, health: NodeHealth) {
	if let Ok(Some(node)) = registry.get(node_id) {
		let _ = registry.record_heartbeat(node_id, status, health, &node.agent_version, &node.address, now_millis());
	}
}

/// Periodically pings an idle session to detect a dead peer before its
/// next task dispatch would (spec.md §4.5 "Three missed pings ⇒ close").
/// Skips a round entirely if the session is currently running a task
/// (its mutex is held elsewhere) rather than competing for it.
fn spawn_idle_keepalive(node_id: u64, pool: Arc<SessionPool>, registry: Arc<Registry>, cancel: CancellationToken) {
	tokio::spawn(async move {
		let mut missed = 0u32;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = tokio::time::sleep(IDLE_KEEPALIVE_INTERVAL) => {}
			}
			let Some(handle) = pool.get(node_id).await else { return };
			let Ok(mut guard) = handle.try_lock() else { continue };
			let nonce: u64 = rand::thread_rng().gen();
			match guard.idle_ping(nonce).await {
				Ok(()) => {
					missed = 0;
					update_node_health(&registry, node_id, NodeStatus::Online, NodeHealth::Healthy);
				}
				Err(e) => {
					missed += 1;
					warn!(node_id = node_id, error = %e, missed = missed, "idle keepalive ping failed");
					if missed >= KEEPALIVE_MISS_LIMIT {
						drop(guard);
						pool.remove(node_id).await;
						update_node_health(&registry, node_id, NodeStatus::Offline, NodeHealth::Unknown);
						return;
					}
				}
			}
		}
	});
}

/// The primary-side orchestrator (C10).
pub struct Controller {
	registry: Arc<Registry>,
	task_store: Arc<TaskStore>,
	pool: Arc<SessionPool>,
	config_source: Arc<dyn ProjectConfigSource>,
	max_attempts: u32,
	project_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
	consecutive_failures: Mutex<HashMap<u64, u32>>,
}

impl Controller {
	pub fn new(
		registry: Arc<Registry>,
		task_store: Arc<TaskStore>,
		pool: Arc<SessionPool>,
		config_source: Arc<dyn ProjectConfigSource>,
		primary_config: &PrimaryConfig,
	) -> Arc<Self> {
		Arc::new(Controller {
			registry,
			task_store,
			pool,
			config_source,
			max_attempts: if primary_config.max_attempts == 0 { DEFAULT_MAX_ATTEMPTS } else { primary_config.max_attempts },
			project_semaphores: Mutex::new(HashMap::new()),
			consecutive_failures: Mutex::new(HashMap::new()),
		})
	}

	/// `TriggerSync(projectName, cause)` (spec.md §4.10): enqueues one
	/// `PENDING` task per configured node, or no-ops if the project is
	/// disabled or unknown.
	pub async fn trigger(&self, project_name: &str, cause: &str) -> Result<Vec<u64>, SyncdError> {
		let Some(entry) = self.config_source.load(project_name).await else {
			return Err(SyncdError::Configuration(crate::error::ConfigError::UnknownProject {
				name: project_name.to_string(),
			}));
		};
		if !entry.config.enabled {
			return Ok(Vec::new());
		}
		entry.config.validate(project_name)?;

		let ignore_config = IgnoreConfigWire {
			defaults: entry.config.ignore_defaults,
			patterns: entry.config.ignore_patterns.clone(),
			permissions: entry.config.ignore_permissions,
		};

		let now = now_millis();
		let mut ids = Vec::with_capacity(entry.config.nodes.len());
		for node in &entry.config.nodes {
			let task = Task {
				id: 0,
				project_name: project_name.to_string(),
				node_id: node.node_id,
				cause: cause.to_string(),
				payload: TaskPayload {
					project_root: entry.project_root.to_string_lossy().into_owned(),
					target_path: node.target_path.clone(),
					ignore_config: ignore_config.clone(),
				},
				state: TaskState::Pending,
				attempt: 0,
				last_error: None,
				created_at: now,
				updated_at: now,
				finished_at: None,
				retry_after: None,
			};
			ids.push(self.task_store.enqueue(task, now)?);
		}
		Ok(ids)
	}

	/// Starts `worker_count` dispatcher workers (spec.md §4.10
	/// "Dispatcher"). Also requeues any tasks orphaned by a prior crash.
	pub fn spawn_dispatcher(self: &Arc<Self>, worker_count: usize, cancel: CancellationToken) {
		let requeued = self.task_store.requeue_orphaned_running_tasks(now_millis()).unwrap_or(0);
		if requeued > 0 {
			info!(requeued = requeued, "requeued orphaned RUNNING tasks from a prior run");
		}
		for worker_id in 0..worker_count.max(1) {
			let controller = self.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move { controller.worker_loop(worker_id, cancel).await });
		}
	}

	async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
		loop {
			if cancel.is_cancelled() {
				return;
			}
			match self.task_store.claim(None, None, now_millis()) {
				Ok(Some(task)) => self.run_one(task, &cancel).await,
				Ok(None) => {
					tokio::select! {
						_ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
						_ = cancel.cancelled() => return,
					}
				}
				Err(e) => {
					warn!(worker_id = worker_id, error = %e, "claim failed");
					tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
				}
			}
		}
	}

	async fn run_one(&self, task: Task, cancel: &CancellationToken) {
		let project_entry = match self.config_source.load(&task.project_name).await {
			Some(entry) => entry,
			None => {
				self.finish_terminal(&task, "unknown project").await;
				return;
			}
		};

		let semaphore = self.project_semaphore(&task.project_name, project_entry.config.max_parallel_nodes).await;
		let _permit = semaphore.acquire().await.expect("project semaphore never closed");

		let Some(session_handle) = self.pool.wait_for(task.node_id, cancel).await else {
			// Cancelled at shutdown with no session ever appearing; leave
			// the task PENDING for the next controller start.
			return;
		};

		let ignore = match self.build_ignore_matcher(&task, &project_entry) {
			Ok(ignore) => ignore,
			Err(e) => {
				self.finish_terminal(&task, &e.to_string()).await;
				return;
			}
		};
		let blockstore = BlockStore::new(project_entry.project_root.clone());

		let mut session = session_handle.lock().await;
		let outcome = session
			.run_task(&task, &project_entry.project_root, Arc::new(ignore), &blockstore)
			.await;
		drop(session);

		match outcome {
			Ok(result) => self.handle_outcome(&task, result).await,
			Err(e) => {
				// A transport failure means the session is no longer
				// trustworthy; drop it so the next dispatch waits for a
				// fresh handshake.
				self.pool.remove(task.node_id).await;
				self.handle_transport_failure(&task, e).await;
			}
		}
	}

	async fn project_semaphore(&self, project_name: &str, max_parallel_nodes: usize) -> Arc<Semaphore> {
		let mut map = self.project_semaphores.lock().await;
		map.entry(project_name.to_string())
			.or_insert_with(|| Arc::new(Semaphore::new(max_parallel_nodes.max(1))))
			.clone()
	}

	fn build_ignore_matcher(&self, task: &Task, entry: &ProjectConfigEntry) -> Result<IgnoreMatcher, SyncdError> {
		let ignore_file_contents = entry
			.config
			.ignore_file
			.as_ref()
			.and_then(|rel| std::fs::read_to_string(entry.project_root.join(rel)).ok());
		let base = IgnoreMatcher::try_new(
			task.payload.ignore_config.defaults,
			&task.payload.ignore_config.patterns,
			ignore_file_contents.as_deref(),
		)?;
		let node_cfg = entry.config.nodes.iter().find(|n| n.node_id == task.node_id);
		Ok(match node_cfg {
			Some(node) => IgnoreMatcher::for_node(&base, &node.include, &node.exclude),
			None => base,
		})
	}

	async fn handle_outcome(&self, task: &Task, outcome: crate::session::TaskOutcome) {
		use crate::wire::messages::TaskReportStatus;
		let now = now_millis();
		match outcome.status {
			TaskReportStatus::Success => {
				let _ = self.task_store.complete(task.id, TaskState::Success, None, now);
				self.note_success(task.node_id).await;
			}
			TaskReportStatus::Cancelled => {
				let _ = self.task_store.complete(task.id, TaskState::Cancelled, None, now);
			}
			TaskReportStatus::Failed => {
				let error = outcome.error.unwrap_or_else(|| "task failed".to_string());
				self.fail_and_maybe_retry(task, error).await;
			}
		}
	}

	async fn handle_transport_failure(&self, task: &Task, error: SyncdError) {
		if !error.is_transient() {
			self.finish_terminal(task, &error.to_string()).await;
			return;
		}
		self.fail_and_maybe_retry(task, error.to_string()).await;
	}

	/// `Integrity` failures get their own policy, separate from the generic
	/// `max_attempts` backoff (spec.md §4.10 failure table): one retry, then
	/// `CORRUPT_SOURCE` if the same block fails again. The wire only carries
	/// the stringified error back from the agent, so a repeat is detected by
	/// prefix match against the task's previous `lastError` rather than by
	/// matching a live [`crate::error::IntegrityError`] variant.
	async fn fail_and_maybe_retry(&self, task: &Task, error: String) {
		if error.starts_with(INTEGRITY_ERROR_PREFIX) {
			self.fail_integrity(task, error).await;
			return;
		}

		let now = now_millis();
		let _ = self.task_store.complete(task.id, TaskState::Failed, Some(error), now);
		self.note_failure(task.node_id).await;

		if task.attempt < self.max_attempts {
			let delay = backoff::full_jitter(task.attempt, RETRY_BASE, RETRY_CAP);
			let not_before = now + delay.as_millis() as i64;
			let _ = self.task_store.schedule_retry(task.id, not_before, now);
		}
		// else: stays FAILED, terminal by exhaustion (spec.md §3 Task lifecycle).
	}

	async fn fail_integrity(&self, task: &Task, error: String) {
		let now = now_millis();
		let repeat = task.last_error.as_deref().map_or(false, |prev| prev.starts_with(INTEGRITY_ERROR_PREFIX));
		if repeat {
			let corrupt = format!("corrupt source, verification failed on retry: {}", error);
			let _ = self.task_store.complete(task.id, TaskState::Failed, Some(corrupt), now);
			self.note_failure(task.node_id).await;
			return;
		}

		let _ = self.task_store.complete(task.id, TaskState::Failed, Some(error), now);
		self.note_failure(task.node_id).await;
		let delay = backoff::full_jitter(task.attempt, RETRY_BASE, RETRY_CAP);
		let not_before = now + delay.as_millis() as i64;
		let _ = self.task_store.schedule_retry(task.id, not_before, now);
	}

	async fn finish_terminal(&self, task: &Task, error: &str) {
		let now = now_millis();
		let _ = self.task_store.complete(task.id, TaskState::Failed, Some(error.to_string()), now);
		self.note_failure(task.node_id).await;
	}

	async fn note_success(&self, node_id: u64) {
		self.consecutive_failures.lock().await.remove(&node_id);
		update_node_health(&self.registry, node_id, NodeStatus::Online, NodeHealth::Healthy);
	}

	/// Three consecutive `FAILED` tasks for the same node (across any
	/// project) mark it `DEGRADED` (spec.md §4.10 "Health updates").
	async fn note_failure(&self, node_id: u64) {
		let mut map = self.consecutive_failures.lock().await;
		let count = map.entry(node_id).or_insert(0);
		*count += 1;
		if *count >= 3 {
			update_node_health(&self.registry, node_id, NodeStatus::Online, NodeHealth::Degraded);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ProjectSyncConfig;

	fn sample_entry(root: PathBuf) -> ProjectConfigEntry {
		ProjectConfigEntry { project_root: root, config: ProjectSyncConfig { enabled: true, ..Default::default() } }
	}

	#[tokio::test]
	async fn trigger_no_ops_when_project_disabled() {
		let dir = tempfile::tempdir().unwrap();
		let task_store = Arc::new(TaskStore::open(&dir.path().join("tasks.redb")).unwrap());
		let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
		let pool = SessionPool::new();

		let config_source = Arc::new(InMemoryProjectConfigSource::new());
		let mut entry = sample_entry(dir.path().to_path_buf());
		entry.config.enabled = false;
		config_source.insert("demo", entry);

		let controller = Controller::new(registry, task_store.clone(), pool, config_source, &PrimaryConfig::default());
		let ids = controller.trigger("demo", "manual").await.unwrap();
		assert!(ids.is_empty());
	}

	#[tokio::test]
	async fn trigger_enqueues_one_task_per_node() {
		let dir = tempfile::tempdir().unwrap();
		let task_store = Arc::new(TaskStore::open(&dir.path().join("tasks.redb")).unwrap());
		let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
		let pool = SessionPool::new();

		let config_source = Arc::new(InMemoryProjectConfigSource::new());
		let mut entry = sample_entry(dir.path().to_path_buf());
		entry.config.nodes = vec![
			config::NodeSyncTarget { node_id: 1, target_path: "/opt/a".to_string(), include: vec![], exclude: vec![] },
			config::NodeSyncTarget { node_id: 2, target_path: "/opt/b".to_string(), include: vec![], exclude: vec![] },
		];
		config_source.insert("demo", entry);

		let controller = Controller::new(registry, task_store.clone(), pool, config_source, &PrimaryConfig::default());
		let ids = controller.trigger("demo", "git-push").await.unwrap();
		assert_eq!(ids.len(), 2);

		let first = task_store.claim(Some("demo"), Some(1), now_millis()).unwrap().unwrap();
		assert_eq!(first.node_id, 1);
		assert_eq!(first.cause, "git-push");
	}

	#[tokio::test]
	async fn trigger_rejects_unknown_project() {
		let dir = tempfile::tempdir().unwrap();
		let task_store = Arc::new(TaskStore::open(&dir.path().join("tasks.redb")).unwrap());
		let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
		let pool = SessionPool::new();
		let config_source = Arc::new(InMemoryProjectConfigSource::new());

		let controller = Controller::new(registry, task_store, pool, config_source, &PrimaryConfig::default());
		let err = controller.trigger("missing", "manual").await.unwrap_err();
		assert!(matches!(err, SyncdError::Configuration(_)));
	}

	#[tokio::test]
	async fn a_first_integrity_failure_is_retried_once() {
		let dir = tempfile::tempdir().unwrap();
		let task_store = Arc::new(TaskStore::open(&dir.path().join("tasks.redb")).unwrap());
		let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
		let pool = SessionPool::new();
		let config_source = Arc::new(InMemoryProjectConfigSource::new());
		let controller =
			Controller::new(registry, task_store.clone(), pool, config_source, &PrimaryConfig { max_attempts: 1, ..Default::default() });

		let id = task_store.enqueue(sample_task(), now_millis()).unwrap();
		let task = task_store.claim(None, None, now_millis()).unwrap().unwrap();
		assert_eq!(task.id, id);

		controller
			.fail_and_maybe_retry(&task, "integrity error: hash mismatch for a.txt block 0: expected aa, got bb".to_string())
			.await;

		let reloaded = task_store.get(id).unwrap().unwrap();
		assert_eq!(reloaded.state, TaskState::Retrying);
		assert!(reloaded.last_error.unwrap().starts_with("integrity error:"));
	}

	#[tokio::test]
	async fn a_repeated_integrity_failure_on_the_same_task_is_terminal() {
		let dir = tempfile::tempdir().unwrap();
		let task_store = Arc::new(TaskStore::open(&dir.path().join("tasks.redb")).unwrap());
		let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
		let pool = SessionPool::new();
		let config_source = Arc::new(InMemoryProjectConfigSource::new());
		let controller = Controller::new(registry, task_store.clone(), pool, config_source, &PrimaryConfig::default());

		let id = task_store.enqueue(sample_task(), now_millis()).unwrap();
		let first_attempt = task_store.claim(None, None, now_millis()).unwrap().unwrap();
		let integrity_error = "integrity error: hash mismatch for a.txt block 0: expected aa, got bb".to_string();
		controller.fail_and_maybe_retry(&first_attempt, integrity_error.clone()).await;
		task_store.schedule_retry(id, 0, now_millis()).unwrap();

		let second_attempt = task_store.claim(None, None, now_millis()).unwrap().unwrap();
		assert!(second_attempt.last_error.as_deref().unwrap().starts_with("integrity error:"));
		controller.fail_and_maybe_retry(&second_attempt, integrity_error).await;

		let reloaded = task_store.get(id).unwrap().unwrap();
		assert_eq!(reloaded.state, TaskState::Failed);
		assert!(reloaded.last_error.unwrap().contains("corrupt source"));
	}

	fn sample_task() -> Task {
		Task {
			id: 0,
			project_name: "demo".to_string(),
			node_id: 1,
			cause: "manual".to_string(),
			payload: TaskPayload {
				project_root: "/srv/demo".to_string(),
				target_path: "/opt/demo".to_string(),
				ignore_config: IgnoreConfigWire::default(),
			},
			state: TaskState::Pending,
			attempt: 0,
			last_error: None,
			created_at: 0,
			updated_at: 0,
			finished_at: None,
			retry_after: None,
		}
	}
}

// vim: ts=4
