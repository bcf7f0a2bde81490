//! `ProjectSyncConfig.maxParallelNodes` bounds how many of a project's node
//! tasks the dispatcher runs at once (spec.md §4.10 "Concurrency"). Drives
//! three real agents under a project capped at two, and asserts the
//! `Running` count for that project is never observed above the cap while
//! still letting every node's task reach `Success`.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use syncd::agent::AgentRuntime;
use syncd::config::{AgentConfig, NodeSyncTarget, PrimaryConfig, ProjectSyncConfig};
use syncd::controller::{Controller, InMemoryProjectConfigSource, Listener, ProjectConfigEntry, SessionPool};
use syncd::registry::{Node, NodeHealth, NodeStatus, Registry};
use syncd::taskstore::{TaskState, TaskStore};

const NODE_IDS: [u64; 3] = [11, 12, 13];
const MAX_PARALLEL_NODES: usize = 2;

#[tokio::test]
async fn running_task_count_never_exceeds_the_configured_cap() {
	let primary_dir = TempDir::new().unwrap();
	let project_dir = TempDir::new().unwrap();

	let registry = std::sync::Arc::new(Registry::open(&primary_dir.path().join("registry.redb")).unwrap());
	let task_store = std::sync::Arc::new(TaskStore::open(&primary_dir.path().join("tasks.redb")).unwrap());
	let pool = SessionPool::new();

	let mut node_targets = Vec::new();
	let mut agent_target_dirs = Vec::new();
	for &node_id in &NODE_IDS {
		registry
			.put(&Node {
				id: node_id,
				name: format!("node-{}", node_id),
				address: String::new(),
				token: format!("token-{}", node_id),
				agent_cert_fingerprint: None,
				status: NodeStatus::Offline,
				health: NodeHealth::Unknown,
				last_seen: None,
				agent_version: String::new(),
			})
			.unwrap();

		let target_dir = TempDir::new().unwrap();
		node_targets.push(NodeSyncTarget {
			node_id,
			target_path: target_dir.path().to_string_lossy().into_owned(),
			include: vec![],
			exclude: vec![],
		});
		agent_target_dirs.push(target_dir);
	}

	let config_source = std::sync::Arc::new(InMemoryProjectConfigSource::new());
	config_source.insert(
		"demo",
		ProjectConfigEntry {
			project_root: project_dir.path().to_path_buf(),
			config: ProjectSyncConfig {
				enabled: true,
				max_parallel_nodes: MAX_PARALLEL_NODES,
				nodes: node_targets,
				..Default::default()
			},
		},
	);

	write_file(project_dir.path(), "a.txt", &vec![0xAB; 512 * 1024]);
	write_file(project_dir.path(), "b.txt", &vec![0xCD; 512 * 1024]);

	let controller = Controller::new(registry.clone(), task_store.clone(), pool.clone(), config_source, &PrimaryConfig::default());

	let identity = std::sync::Arc::new(syncd::tls::load_or_generate_identity(&primary_dir.path().join("tls")).unwrap());
	let listener = Listener::bind("127.0.0.1:0", identity, registry.clone(), pool.clone()).await.unwrap();
	let addr = listener.local_addr().unwrap();

	let cancel = CancellationToken::new();
	controller.spawn_dispatcher(4, cancel.clone());
	let serve_cancel = cancel.clone();
	tokio::spawn(async move {
		let _ = listener.serve(serve_cancel).await;
	});

	let mut agent_dirs = Vec::new();
	for &node_id in &NODE_IDS {
		let agent_dir = TempDir::new().unwrap();
		let agent_config = AgentConfig {
			node_id,
			token: format!("token-{}", node_id),
			primary_addr: addr.to_string(),
			pinned_server_fingerprint: None,
			tls_dir: agent_dir.path().join("tls"),
			heartbeat_interval: Duration::from_secs(30),
			hostname: format!("agent-{}", node_id),
		};
		let runtime = AgentRuntime::new(agent_config).unwrap();
		tokio::spawn(async move {
			let _ = runtime.run().await;
		});
		agent_dirs.push(agent_dir);
	}

	for &node_id in &NODE_IDS {
		wait_until(Duration::from_secs(5), || {
			let pool = pool.clone();
			async move { pool.is_connected(node_id).await }
		})
		.await;
	}

	let ids = controller.trigger("demo", "test").await.unwrap();
	assert_eq!(ids.len(), NODE_IDS.len());

	let mut max_running_observed = 0usize;
	let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
	loop {
		let running = task_store.list(Some("demo"), None, Some(TaskState::Running), None).unwrap();
		max_running_observed = max_running_observed.max(running.len());
		assert!(
			running.len() <= MAX_PARALLEL_NODES,
			"observed {} running tasks, more than the configured cap of {}",
			running.len(),
			MAX_PARALLEL_NODES
		);

		let all_settled = ids.iter().all(|&id| {
			matches!(
				task_store.get(id).unwrap().map(|t| t.state),
				Some(TaskState::Success) | Some(TaskState::Failed) | Some(TaskState::Cancelled)
			)
		});
		if all_settled {
			break;
		}
		assert!(tokio::time::Instant::now() < deadline, "tasks did not settle in time");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	for &id in &ids {
		let task = task_store.get(id).unwrap().unwrap();
		assert_eq!(task.state, TaskState::Success, "task {} failed: {:?}", id, task.last_error);
	}

	cancel.cancel();
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if check().await {
			return;
		}
		assert!(tokio::time::Instant::now() < deadline, "condition never became true");
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

fn write_file(dir: &Path, name: &str, content: &[u8]) {
	std::fs::write(dir.join(name), content).unwrap();
}

// vim: ts=4
