//! Task envelope, per-task options and the producer-facing state snapshot.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CdResult, Error};
use crate::types::Timestamp;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Per-task processing options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
	pub queue: Box<str>,
	pub max_retries: u32,
	/// Bound on a single attempt, measured from the moment it becomes active
	pub timeout: Option<Duration>,
	/// Absolute bound on every attempt
	pub deadline: Option<Timestamp>,
	/// Earliest processing time; `None` or a past instant means ready now
	pub process_at: Option<Timestamp>,
	/// How long a completed task is kept (and its unique key held)
	pub retention: Option<Duration>,
	pub unique_key: Option<Box<str>>,
}

impl Default for TaskOptions {
	fn default() -> Self {
		Self {
			queue: DEFAULT_QUEUE.into(),
			max_retries: DEFAULT_MAX_RETRIES,
			timeout: None,
			deadline: None,
			process_at: None,
			retention: None,
			unique_key: None,
		}
	}
}

impl TaskOptions {
	pub fn queue(mut self, queue: impl Into<Box<str>>) -> Self {
		self.queue = queue.into();
		self
	}

	pub fn max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn deadline(mut self, deadline: Timestamp) -> Self {
		self.deadline = Some(deadline);
		self
	}

	pub fn process_at(mut self, at: Timestamp) -> Self {
		self.process_at = Some(at);
		self
	}

	pub fn process_in(mut self, delay: Duration) -> Self {
		self.process_at = Some(Timestamp::from_now(delay));
		self
	}

	pub fn retention(mut self, retention: Duration) -> Self {
		self.retention = Some(retention);
		self
	}

	pub fn unique_key(mut self, key: impl Into<Box<str>>) -> Self {
		self.unique_key = Some(key.into());
		self
	}

	/// Earlier of `deadline` and `started + timeout`
	pub fn effective_deadline(&self, started: Timestamp) -> Option<Timestamp> {
		let by_timeout = self.timeout.map(|t| started.add_duration(t));
		match (self.deadline, by_timeout) {
			(Some(d), Some(t)) => Some(d.min(t)),
			(d, t) => d.or(t),
		}
	}

	pub fn validate(&self) -> CdResult<()> {
		if self.queue.trim().is_empty() {
			return Err(Error::ValidationError("queue name must not be empty".into()));
		}
		if self.timeout.is_some_and(|t| t.is_zero()) {
			return Err(Error::ValidationError("timeout must be positive".into()));
		}
		if self.unique_key.as_deref().is_some_and(|k| k.is_empty()) {
			return Err(Error::ValidationError("unique key must not be empty".into()));
		}
		Ok(())
	}
}

/// Immutable unit of work: type tag, opaque payload and options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskEnvelope {
	kind: Box<str>,
	payload: Box<[u8]>,
	options: TaskOptions,
}

impl TaskEnvelope {
	pub fn new(kind: impl Into<Box<str>>, payload: impl Into<Box<[u8]>>) -> Self {
		Self { kind: kind.into(), payload: payload.into(), options: TaskOptions::default() }
	}

	/// Build an envelope whose payload is the JSON encoding of `value`
	pub fn json<T: Serialize>(kind: impl Into<Box<str>>, value: &T) -> CdResult<Self> {
		let payload = serde_json::to_vec(value)?;
		Ok(Self::new(kind, payload))
	}

	#[must_use]
	pub fn with_options(mut self, options: TaskOptions) -> Self {
		self.options = options;
		self
	}

	pub fn kind(&self) -> &str {
		&self.kind
	}

	pub fn payload(&self) -> &[u8] {
		&self.payload
	}

	pub fn options(&self) -> &TaskOptions {
		&self.options
	}

	/// Decode a JSON payload. Malformed payloads are a `Parse` error.
	pub fn decode<T: DeserializeOwned>(&self) -> CdResult<T> {
		serde_json::from_slice(&self.payload)
			.map_err(|e| Error::Parse(format!("{}: invalid payload: {}", self.kind, e)))
	}

	pub fn validate(&self) -> CdResult<()> {
		if self.kind.trim().is_empty() {
			return Err(Error::ValidationError("task type must not be empty".into()));
		}
		self.options.validate()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
	Pending,
	Scheduled,
	Active,
	Retry,
	Archived,
	Completed,
}

impl TaskState {
	pub fn is_terminal(self) -> bool {
		matches!(self, TaskState::Archived | TaskState::Completed)
	}
}

impl std::fmt::Display for TaskState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TaskState::Pending => "pending",
			TaskState::Scheduled => "scheduled",
			TaskState::Active => "active",
			TaskState::Retry => "retry",
			TaskState::Archived => "archived",
			TaskState::Completed => "completed",
		};
		f.write_str(s)
	}
}

/// Read-only snapshot of a stored task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInfo {
	pub id: Box<str>,
	pub queue: Box<str>,
	pub kind: Box<str>,
	pub state: TaskState,
	/// Budget-consuming failures so far
	pub retried: u32,
	pub max_retries: u32,
	pub next_process_at: Option<Timestamp>,
	pub last_error: Option<Box<str>>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Batch {
		ids: Vec<String>,
	}

	#[test]
	fn test_effective_deadline_earlier_wins() {
		let started = Timestamp(10_000);
		let opts = TaskOptions::default()
			.timeout(Duration::from_secs(5))
			.deadline(Timestamp(12_000));
		assert_eq!(opts.effective_deadline(started), Some(Timestamp(12_000)));

		let opts = TaskOptions::default()
			.timeout(Duration::from_secs(1))
			.deadline(Timestamp(12_000));
		assert_eq!(opts.effective_deadline(started), Some(Timestamp(11_000)));

		assert_eq!(TaskOptions::default().effective_deadline(started), None);
	}

	#[test]
	fn test_validate() {
		assert!(TaskEnvelope::new("", Vec::new()).validate().is_err());
		assert!(TaskEnvelope::new("  ", Vec::new()).validate().is_err());
		assert!(TaskEnvelope::new("event:aws", Vec::new()).validate().is_ok());

		let bad_queue = TaskEnvelope::new("event:aws", Vec::new())
			.with_options(TaskOptions::default().queue(""));
		assert!(matches!(bad_queue.validate(), Err(Error::ValidationError(_))));
	}

	#[test]
	fn test_json_payload() -> CdResult<()> {
		let batch = Batch { ids: vec!["a".into(), "b".into()] };
		let env = TaskEnvelope::json("event:start", &batch)?;
		assert_eq!(env.decode::<Batch>()?, batch);

		let broken = TaskEnvelope::new("event:start", b"{not json".to_vec());
		assert!(matches!(broken.decode::<Batch>(), Err(Error::Parse(_))));
		Ok(())
	}
}

// vim: ts=4
