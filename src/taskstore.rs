//! Durable sync task queue (C9, spec.md §4.9).
//!
//! Backed by the same `redb` embedded store the node registry uses, values
//! bincode behind a schema-version byte (see [`crate::durable`]). The
//! FIFO-per-`(projectName, nodeId)` ordering guarantee (spec.md §3
//! invariant 2, §5) is enforced entirely in [`TaskStore::claim`]: tasks are
//! scanned in creation order and, for each key, only the earliest
//! non-terminal task is ever eligible.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::durable;
use crate::error::SyncdError;
use crate::wire::messages::IgnoreConfigWire;

const TASKS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");
const NEXT_ID_KEY: &str = "next_task_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
	Pending,
	Running,
	Success,
	Failed,
	Retrying,
	Cancelled,
}

impl TaskState {
	fn is_terminal(self) -> bool {
		matches!(self, TaskState::Success | TaskState::Failed | TaskState::Cancelled)
	}
}

/// The project root, target path, and ignore-config snapshot a task was
/// created with — frozen at enqueue time so retries replay the same
/// intent even if the live project config has since changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
	pub project_root: String,
	pub target_path: String,
	pub ignore_config: IgnoreConfigWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	pub id: u64,
	pub project_name: String,
	pub node_id: u64,
	/// e.g. `git-push`, `fs-change`, `manual` (spec.md §3 `Task.cause`).
	pub cause: String,
	pub payload: TaskPayload,
	pub state: TaskState,
	pub attempt: u32,
	pub last_error: Option<String>,
	/// Unix milliseconds.
	pub created_at: i64,
	pub updated_at: i64,
	pub finished_at: Option<i64>,
	/// Set by [`TaskStore::schedule_retry`]; a `Retrying` task is only
	/// claimable once `now >= retry_after`.
	pub retry_after: Option<i64>,
}

pub struct TaskStore {
	db: redb::Database,
}

impl TaskStore {
	pub fn open(path: &Path) -> Result<Self, SyncdError> {
		let db = redb::Database::create(path).map_err(|e| SyncdError::Other { message: e.to_string() })?;
		{
			let write_txn = db.begin_write().map_err(db_err)?;
			{
				let _ = write_txn.open_table(TASKS_TABLE).map_err(db_err)?;
				let _ = write_txn.open_table(COUNTERS_TABLE).map_err(db_err)?;
			}
			write_txn.commit().map_err(db_err)?;
		}
		Ok(TaskStore { db })
	}

	/// `Enqueue(Task) -> id`. `task.id` in the argument is ignored; the
	/// store assigns the monotonic id.
	pub fn enqueue(&self, mut task: Task, now_millis: i64) -> Result<u64, SyncdError> {
		let write_txn = self.db.begin_write().map_err(db_err)?;
		let id = {
			let mut counters = write_txn.open_table(COUNTERS_TABLE).map_err(db_err)?;
			let next = counters.get(NEXT_ID_KEY).map_err(db_err)?.map(|v| v.value()).unwrap_or(1);
			counters.insert(NEXT_ID_KEY, next + 1).map_err(db_err)?;
			next
		};
		task.id = id;
		task.state = TaskState::Pending;
		task.attempt = 0;
		task.created_at = now_millis;
		task.updated_at = now_millis;
		task.finished_at = None;
		task.retry_after = None;
		{
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_err)?;
			let bytes = durable::encode(&task)?;
			table.insert(id, bytes.as_slice()).map_err(db_err)?;
		}
		write_txn.commit().map_err(db_err)?;
		Ok(id)
	}

	/// `Claim(projectName?, nodeId?) -> Task?`. Atomically transitions the
	/// earliest eligible task for its `(projectName, nodeId)` key from
	/// `Pending`/ready-`Retrying` to `Running`, incrementing `attempt`.
	pub fn claim(
		&self,
		project_name: Option<&str>,
		node_id: Option<u64>,
		now_millis: i64,
	) -> Result<Option<Task>, SyncdError> {
		let write_txn = self.db.begin_write().map_err(db_err)?;
		let claimed = {
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_err)?;

			let mut ordered: Vec<Task> = Vec::new();
			for entry in table.iter().map_err(db_err)? {
				let (_, value) = entry.map_err(db_err)?;
				let task: Task = durable::decode(value.value())?;
				ordered.push(task);
			}
			ordered.sort_by_key(|t| t.id);

			let mut seen_keys: HashSet<(String, u64)> = HashSet::new();
			let mut to_claim: Option<Task> = None;
			for task in ordered {
				if task.state.is_terminal() {
					continue;
				}
				let key = (task.project_name.clone(), task.node_id);
				if seen_keys.contains(&key) {
					continue;
				}
				seen_keys.insert(key);

				let matches_filter = project_name.map_or(true, |p| p == task.project_name)
					&& node_id.map_or(true, |n| n == task.node_id);
				if !matches_filter {
					continue;
				}

				match task.state {
					TaskState::Pending => {
						to_claim = Some(task);
						break;
					}
					TaskState::Retrying if task.retry_after.map_or(true, |t| now_millis >= t) => {
						to_claim = Some(task);
						break;
					}
					_ => continue,
				}
			}

			if let Some(mut task) = to_claim {
				task.state = TaskState::Running;
				task.attempt += 1;
				task.updated_at = now_millis;
				task.retry_after = None;
				let bytes = durable::encode(&task)?;
				table.insert(task.id, bytes.as_slice()).map_err(db_err)?;
				Some(task)
			} else {
				None
			}
		};
		write_txn.commit().map_err(db_err)?;
		Ok(claimed)
	}

	/// `Complete(id, status, error?)`. `status` must be one of
	/// `Success`, `Failed`, or `Cancelled` — use [`Self::schedule_retry`]
	/// to move a `Failed` task back into the claimable pool.
	pub fn complete(
		&self,
		id: u64,
		status: TaskState,
		error: Option<String>,
		now_millis: i64,
	) -> Result<(), SyncdError> {
		self.update(id, now_millis, |task| {
			task.state = status;
			task.last_error = error;
			task.finished_at = Some(now_millis);
		})
	}

	/// Moves a `Failed` task back into the pool, claimable once
	/// `not_before_millis` has passed (spec.md §4.10 retry policy).
	pub fn schedule_retry(&self, id: u64, not_before_millis: i64, now_millis: i64) -> Result<(), SyncdError> {
		self.update(id, now_millis, |task| {
			task.state = TaskState::Retrying;
			task.retry_after = Some(not_before_millis);
			task.finished_at = None;
		})
	}

	pub fn get(&self, id: u64) -> Result<Option<Task>, SyncdError> {
		let read_txn = self.db.begin_read().map_err(db_err)?;
		let table = read_txn.open_table(TASKS_TABLE).map_err(db_err)?;
		match table.get(id).map_err(db_err)? {
			Some(value) => {
				let task = durable::decode(value.value())?;
				Ok(Some(task))
			}
			None => Ok(None),
		}
	}

	/// `List(filter, paging)`, narrowed to the filters C10 actually needs.
	pub fn list(
		&self,
		project_name: Option<&str>,
		node_id: Option<u64>,
		state: Option<TaskState>,
		limit: Option<usize>,
	) -> Result<Vec<Task>, SyncdError> {
		let read_txn = self.db.begin_read().map_err(db_err)?;
		let table = read_txn.open_table(TASKS_TABLE).map_err(db_err)?;
		let mut tasks = Vec::new();
		for entry in table.iter().map_err(db_err)? {
			let (_, value) = entry.map_err(db_err)?;
			let task: Task = durable::decode(value.value())?;
			if project_name.map_or(true, |p| p == task.project_name)
				&& node_id.map_or(true, |n| n == task.node_id)
				&& state.map_or(true, |s| s == task.state)
			{
				tasks.push(task);
			}
		}
		tasks.sort_by_key(|t| t.id);
		if let Some(limit) = limit {
			tasks.truncate(limit);
		}
		Ok(tasks)
	}

	/// Rolls every `Running` task back to `Pending` — called once at
	/// controller startup so a prior crash's in-flight tasks are retried
	/// rather than stuck (spec.md §4.10 failure table, "Controller
	/// shutdown ... task rolled back to PENDING on next start").
	pub fn requeue_orphaned_running_tasks(&self, now_millis: i64) -> Result<usize, SyncdError> {
		let write_txn = self.db.begin_write().map_err(db_err)?;
		let mut requeued = 0usize;
		{
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_err)?;
			let mut to_update: HashMap<u64, Task> = HashMap::new();
			for entry in table.iter().map_err(db_err)? {
				let (key, value) = entry.map_err(db_err)?;
				let mut task: Task = durable::decode(value.value())?;
				if task.state == TaskState::Running {
					task.state = TaskState::Pending;
					task.updated_at = now_millis;
					to_update.insert(key.value(), task);
				}
			}
			for (id, task) in to_update {
				let bytes = durable::encode(&task)?;
				table.insert(id, bytes.as_slice()).map_err(db_err)?;
				requeued += 1;
			}
		}
		write_txn.commit().map_err(db_err)?;
		Ok(requeued)
	}

	fn update(&self, id: u64, now_millis: i64, f: impl FnOnce(&mut Task)) -> Result<(), SyncdError> {
		let write_txn = self.db.begin_write().map_err(db_err)?;
		{
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_err)?;
			let mut task: Task = match table.get(id).map_err(db_err)? {
				Some(value) => durable::decode(value.value())?,
				None => {
					return Err(SyncdError::Other { message: format!("no such task: {}", id) });
				}
			};
			f(&mut task);
			task.updated_at = now_millis;
			let bytes = durable::encode(&task)?;
			table.insert(id, bytes.as_slice()).map_err(db_err)?;
		}
		write_txn.commit().map_err(db_err)?;
		Ok(())
	}
}

fn db_err<E: std::fmt::Display>(e: E) -> SyncdError {
	SyncdError::Other { message: e.to_string() }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_task(project: &str, node: u64) -> Task {
		Task {
			id: 0,
			project_name: project.to_string(),
			node_id: node,
			cause: "manual".to_string(),
			payload: TaskPayload {
				project_root: "/srv/app".to_string(),
				target_path: "/opt/app".to_string(),
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

	#[test]
	fn enqueue_assigns_monotonic_ids() {
		let dir = tempfile::tempdir().unwrap();
		let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
		let a = store.enqueue(sample_task("demo", 1), 1000).unwrap();
		let b = store.enqueue(sample_task("demo", 1), 1001).unwrap();
		assert!(b > a);
	}

	#[test]
	fn claim_respects_fifo_per_project_and_node() {
		let dir = tempfile::tempdir().unwrap();
		let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
		let first = store.enqueue(sample_task("demo", 1), 1000).unwrap();
		let second = store.enqueue(sample_task("demo", 1), 1001).unwrap();

		let claimed = store.claim(None, None, 2000).unwrap().unwrap();
		assert_eq!(claimed.id, first);
		assert_eq!(claimed.state, TaskState::Running);
		assert_eq!(claimed.attempt, 1);

		// Second task must not be claimable while the first is RUNNING.
		let next = store.claim(None, None, 2001).unwrap();
		assert!(next.is_none(), "second task claimed while first still running");

		store.complete(first, TaskState::Success, None, 2100).unwrap();
		let next = store.claim(None, None, 2200).unwrap().unwrap();
		assert_eq!(next.id, second);
	}

	#[test]
	fn independent_keys_can_run_concurrently() {
		let dir = tempfile::tempdir().unwrap();
		let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
		store.enqueue(sample_task("demo", 1), 1000).unwrap();
		store.enqueue(sample_task("demo", 2), 1001).unwrap();

		let first = store.claim(None, None, 2000).unwrap().unwrap();
		let second = store.claim(None, None, 2001).unwrap().unwrap();
		assert_ne!(first.node_id, second.node_id);
	}

	#[test]
	fn retrying_task_is_not_claimable_before_retry_after() {
		let dir = tempfile::tempdir().unwrap();
		let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
		let id = store.enqueue(sample_task("demo", 1), 1000).unwrap();
		store.claim(None, None, 2000).unwrap();
		store.complete(id, TaskState::Failed, Some("io error".to_string()), 2100).unwrap();
		store.schedule_retry(id, 5000, 2100).unwrap();

		assert!(store.claim(None, None, 3000).unwrap().is_none());
		let claimed = store.claim(None, None, 6000).unwrap().unwrap();
		assert_eq!(claimed.id, id);
		assert_eq!(claimed.attempt, 2);
	}

	#[test]
	fn requeue_orphaned_running_tasks_resets_to_pending() {
		let dir = tempfile::tempdir().unwrap();
		let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
		let id = store.enqueue(sample_task("demo", 1), 1000).unwrap();
		store.claim(None, None, 2000).unwrap();

		let requeued = store.requeue_orphaned_running_tasks(3000).unwrap();
		assert_eq!(requeued, 1);
		assert_eq!(store.get(id).unwrap().unwrap().state, TaskState::Pending);
	}
}

// vim: ts=4
