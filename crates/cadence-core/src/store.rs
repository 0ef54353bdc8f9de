//! Queue store. The durable backend is external; `QueueStore` is the seam it
//! plugs into and `MemoryQueueStore` is the in-process implementation.

use async_trait::async_trait;
use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex},
	time::Duration,
};

use crate::prelude::*;

/// A stored task together with its bookkeeping
#[derive(Clone, Debug)]
pub struct TaskRecord {
	pub id: Box<str>,
	pub envelope: TaskEnvelope,
	pub state: TaskState,
	/// Budget-consuming failures
	pub retried: u32,
	/// Every attempt, including ones that did not count against the budget
	pub attempts: u32,
	pub enqueued_at: Timestamp,
	pub process_at: Timestamp,
	pub started_at: Option<Timestamp>,
	/// While active: the worker's claim expires at this instant unless extended
	pub lease_until: Option<Timestamp>,
	pub completed_at: Option<Timestamp>,
	pub last_error: Option<Box<str>>,
}

impl TaskRecord {
	pub fn info(&self) -> TaskInfo {
		let state = match self.state {
			TaskState::Scheduled if self.process_at <= Timestamp::now() => TaskState::Pending,
			state => state,
		};
		TaskInfo {
			id: self.id.clone(),
			queue: self.envelope.options().queue.clone(),
			kind: self.envelope.kind().into(),
			state,
			retried: self.retried,
			max_retries: self.envelope.options().max_retries,
			next_process_at: if state.is_terminal() || state == TaskState::Active {
				None
			} else {
				Some(self.process_at)
			},
			last_error: self.last_error.clone(),
		}
	}
}

#[async_trait]
pub trait QueueStore: Send + Sync {
	/// Store a new task. Fails with `DuplicateTask` if its unique key is held.
	async fn enqueue(&self, envelope: TaskEnvelope) -> CdResult<TaskInfo>;
	/// Claim the oldest ready task of the first queue in `queues` that has one,
	/// leasing it to the caller for `lease`
	async fn dequeue(&self, queues: &[&str], lease: Duration) -> CdResult<Option<TaskRecord>>;
	/// Push the lease of an active task forward. Returns `false` if the task is
	/// no longer active.
	async fn extend_lease(&self, id: &str, until: Timestamp) -> CdResult<bool>;
	async fn complete(&self, id: &str) -> CdResult<()>;
	/// Schedule another attempt; `is_failure` decides whether it counts against the budget
	async fn retry(
		&self,
		id: &str,
		process_at: Timestamp,
		error: &str,
		is_failure: bool,
	) -> CdResult<()>;
	async fn archive(&self, id: &str, error: &str) -> CdResult<()>;
	/// Put an interrupted active task back without touching its retry count
	async fn requeue(&self, id: &str) -> CdResult<()>;
	async fn get(&self, id: &str) -> CdResult<TaskInfo>;
	async fn list(&self, queue: &str) -> CdResult<Vec<TaskRecord>>;
	/// Put active tasks whose lease expired back into their queue, as a
	/// failed attempt. Returns how many were recovered.
	async fn recover_orphans(&self, now: Timestamp) -> CdResult<usize>;
	/// Drop completed tasks whose retention expired and archived tasks past the
	/// archive limits; returns how many were removed
	async fn purge_expired(&self, now: Timestamp) -> CdResult<usize>;
}

pub const DEFAULT_ARCHIVE_RETENTION: Duration = Duration::from_secs(90 * 24 * 3600);
pub const DEFAULT_ARCHIVE_MAX: usize = 10_000;

// MemoryQueueStore
//******************
#[derive(Debug)]
struct UniqueLock {
	id: Box<str>,
	/// `None` while the owning task is still live
	expires_at: Option<Timestamp>,
}

type ReadyIndex = BTreeMap<(Timestamp, u64), Box<str>>;

#[derive(Debug, Default)]
struct StoreInner {
	tasks: HashMap<Box<str>, TaskRecord>,
	ready: HashMap<Box<str>, ReadyIndex>,
	unique: HashMap<Box<str>, UniqueLock>,
	seq: u64,
	closed: bool,
}

fn is_dispatchable(state: TaskState) -> bool {
	matches!(state, TaskState::Pending | TaskState::Scheduled | TaskState::Retry)
}

impl StoreInner {
	fn push_ready(&mut self, queue: &str, at: Timestamp, id: Box<str>) {
		self.seq += 1;
		let seq = self.seq;
		self.ready.entry(queue.into()).or_default().insert((at, seq), id);
	}

	fn task_mut(&mut self, id: &str) -> CdResult<&mut TaskRecord> {
		self.tasks.get_mut(id).ok_or(Error::NotFound)
	}

	fn check_open(&self) -> CdResult<()> {
		if self.closed {
			return Err(Error::StoreUnavailable("queue store is closed".into()));
		}
		Ok(())
	}

	fn release_unique(&mut self, envelope: &TaskEnvelope, id: &str) {
		if let Some(key) = envelope.options().unique_key.as_deref() {
			if self.unique.get(key).is_some_and(|l| &*l.id == id) {
				self.unique.remove(key);
			}
		}
	}
}

#[derive(Debug)]
pub struct MemoryQueueStore {
	inner: Mutex<StoreInner>,
	archive_retention: Duration,
	archive_max: usize,
}

impl Default for MemoryQueueStore {
	fn default() -> Self {
		Self {
			inner: Mutex::default(),
			archive_retention: DEFAULT_ARCHIVE_RETENTION,
			archive_max: DEFAULT_ARCHIVE_MAX,
		}
	}
}

impl MemoryQueueStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Archived tasks are kept for `retention`, and at most `max` of them
	pub fn with_archive_limits(retention: Duration, max: usize) -> Arc<Self> {
		Arc::new(Self { archive_retention: retention, archive_max: max, ..Self::default() })
	}

	/// Reject all further writes with `StoreUnavailable`
	pub fn close(&self) -> CdResult<()> {
		lock!(self.inner, "store")?.closed = true;
		Ok(())
	}

	pub fn reopen(&self) -> CdResult<()> {
		lock!(self.inner, "store")?.closed = false;
		Ok(())
	}

	/// Number of stored tasks in `state`, across all queues
	pub fn count(&self, state: TaskState) -> CdResult<usize> {
		let inner = lock!(self.inner, "store")?;
		Ok(inner.tasks.values().filter(|t| t.info().state == state).count())
	}
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
	async fn enqueue(&self, envelope: TaskEnvelope) -> CdResult<TaskInfo> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let now = Timestamp::now();

		if let Some(key) = envelope.options().unique_key.as_deref() {
			match inner.unique.get(key) {
				Some(UniqueLock { expires_at: None, .. }) => {
					return Err(Error::DuplicateTask(key.into()));
				}
				Some(UniqueLock { expires_at: Some(exp), .. }) if *exp > now => {
					return Err(Error::DuplicateTask(key.into()));
				}
				_ => (),
			}
		}

		let id: Box<str> = uuid::Uuid::new_v4().to_string().into();
		let process_at = envelope.options().process_at.unwrap_or(now).max(now);
		let state =
			if process_at > now { TaskState::Scheduled } else { TaskState::Pending };
		let queue = envelope.options().queue.clone();

		if let Some(key) = envelope.options().unique_key.clone() {
			inner.unique.insert(key, UniqueLock { id: id.clone(), expires_at: None });
		}
		let record = TaskRecord {
			id: id.clone(),
			envelope,
			state,
			retried: 0,
			attempts: 0,
			enqueued_at: now,
			process_at,
			started_at: None,
			lease_until: None,
			completed_at: None,
			last_error: None,
		};
		let info = record.info();
		inner.tasks.insert(id.clone(), record);
		inner.push_ready(&queue, process_at, id);
		Ok(info)
	}

	async fn dequeue(&self, queues: &[&str], lease: Duration) -> CdResult<Option<TaskRecord>> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let now = Timestamp::now();

		for queue in queues {
			loop {
				let Some(index) = inner.ready.get_mut(*queue) else { break };
				let Some((&key, _)) = index.first_key_value() else { break };
				if key.0 > now {
					break;
				}
				let Some(id) = index.remove(&key) else { break };
				// entries left behind by a recovered or already finished attempt
				let Some(task) = inner.tasks.get_mut(&id).filter(|t| is_dispatchable(t.state)) else {
					continue;
				};
				task.state = TaskState::Active;
				task.attempts += 1;
				task.started_at = Some(now);
				task.lease_until = Some(now.add_duration(lease));
				return Ok(Some(task.clone()));
			}
		}
		Ok(None)
	}

	async fn extend_lease(&self, id: &str, until: Timestamp) -> CdResult<bool> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let task = inner.task_mut(id)?;
		if task.state != TaskState::Active {
			return Ok(false);
		}
		task.lease_until = Some(until);
		Ok(true)
	}

	async fn complete(&self, id: &str) -> CdResult<()> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let now = Timestamp::now();
		let task = inner.task_mut(id)?;
		task.state = TaskState::Completed;
		task.completed_at = Some(now);
		task.lease_until = None;
		task.last_error = None;
		let retention = task.envelope.options().retention;
		let unique_key = task.envelope.options().unique_key.clone();

		match retention {
			Some(retention) => {
				if let Some(key) = unique_key {
					if let Some(lock) = inner.unique.get_mut(&key) {
						lock.expires_at = Some(now.add_duration(retention));
					}
				}
			}
			None => {
				if let Some(task) = inner.tasks.remove(id) {
					inner.release_unique(&task.envelope, id);
				}
			}
		}
		Ok(())
	}

	async fn retry(
		&self,
		id: &str,
		process_at: Timestamp,
		error: &str,
		is_failure: bool,
	) -> CdResult<()> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let task = inner.task_mut(id)?;
		task.state = TaskState::Retry;
		task.process_at = process_at;
		task.lease_until = None;
		task.last_error = Some(error.into());
		if is_failure {
			task.retried += 1;
		}
		let queue = task.envelope.options().queue.clone();
		inner.push_ready(&queue, process_at, id.into());
		Ok(())
	}

	async fn archive(&self, id: &str, error: &str) -> CdResult<()> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let task = inner.task_mut(id)?;
		task.state = TaskState::Archived;
		task.completed_at = Some(Timestamp::now());
		task.lease_until = None;
		task.last_error = Some(error.into());
		let envelope = task.envelope.clone();
		inner.release_unique(&envelope, id);
		Ok(())
	}

	async fn requeue(&self, id: &str) -> CdResult<()> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let now = Timestamp::now();
		let task = inner.task_mut(id)?;
		task.state = TaskState::Pending;
		task.process_at = now;
		task.started_at = None;
		task.lease_until = None;
		let queue = task.envelope.options().queue.clone();
		inner.push_ready(&queue, now, id.into());
		Ok(())
	}

	async fn get(&self, id: &str) -> CdResult<TaskInfo> {
		let inner = lock!(self.inner, "store")?;
		inner.tasks.get(id).map(TaskRecord::info).ok_or(Error::NotFound)
	}

	async fn list(&self, queue: &str) -> CdResult<Vec<TaskRecord>> {
		let inner = lock!(self.inner, "store")?;
		let mut tasks: Vec<TaskRecord> = inner
			.tasks
			.values()
			.filter(|t| &*t.envelope.options().queue == queue)
			.cloned()
			.collect();
		tasks.sort_by_key(|t| t.enqueued_at);
		Ok(tasks)
	}

	async fn recover_orphans(&self, now: Timestamp) -> CdResult<usize> {
		let mut inner = lock!(self.inner, "store")?;
		inner.check_open()?;
		let orphans: Vec<Box<str>> = inner
			.tasks
			.values()
			.filter(|t| t.state == TaskState::Active && t.lease_until.is_some_and(|l| l <= now))
			.map(|t| t.id.clone())
			.collect();

		for id in &orphans {
			let task = inner.task_mut(id)?;
			task.lease_until = None;
			task.last_error = Some("task lease expired".into());
			if task.retried >= task.envelope.options().max_retries {
				warn!("Task {} lease expired with no retries left, archiving", id);
				task.state = TaskState::Archived;
				task.completed_at = Some(now);
				let envelope = task.envelope.clone();
				inner.release_unique(&envelope, id);
			} else {
				warn!("Task {} lease expired, re-queueing", id);
				task.state = TaskState::Retry;
				task.retried += 1;
				task.process_at = now;
				let queue = task.envelope.options().queue.clone();
				inner.push_ready(&queue, now, id.clone());
			}
		}
		Ok(orphans.len())
	}

	async fn purge_expired(&self, now: Timestamp) -> CdResult<usize> {
		let mut inner = lock!(self.inner, "store")?;
		let mut expired: Vec<Box<str>> = inner
			.tasks
			.values()
			.filter(|t| match (t.state, t.completed_at) {
				(TaskState::Completed, Some(done)) => {
					t.envelope.options().retention.is_none_or(|r| done.add_duration(r) <= now)
				}
				(TaskState::Completed, None) => true,
				(TaskState::Archived, Some(done)) => done.add_duration(self.archive_retention) <= now,
				_ => false,
			})
			.map(|t| t.id.clone())
			.collect();

		// oldest archived tasks beyond the cap
		let mut archived: Vec<(Timestamp, Box<str>)> = inner
			.tasks
			.values()
			.filter(|t| t.state == TaskState::Archived && !expired.contains(&t.id))
			.map(|t| (t.completed_at.unwrap_or_default(), t.id.clone()))
			.collect();
		if archived.len() > self.archive_max {
			archived.sort_unstable();
			let excess = archived.len() - self.archive_max;
			expired.extend(archived.into_iter().take(excess).map(|(_, id)| id));
		}

		for id in &expired {
			if let Some(task) = inner.tasks.remove(id) {
				inner.release_unique(&task.envelope, id);
			}
		}
		if !expired.is_empty() {
			debug!("Purged {} finished tasks", expired.len());
		}
		Ok(expired.len())
	}
}


// vim: ts=4
