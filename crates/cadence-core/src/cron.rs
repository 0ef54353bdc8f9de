//! Cron scheduler. A single background task owns every entry; registration
//! and inspection go through a command channel.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use croner::Cron;
use std::{str::FromStr, sync::Mutex, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::prelude::*;

const EVERY_PREFIX: &str = "@every ";

/// Parsed cron specification
#[derive(Debug, Clone)]
pub enum Schedule {
	/// Standard cron expression or alias (`@hourly`, `@daily`, ...)
	Cron(Box<Cron>),
	/// Fixed interval (`@every 1m30s`)
	Every(Duration),
}

impl Schedule {
	pub fn parse(spec: &str) -> CdResult<Self> {
		let spec = spec.trim();
		if let Some(interval) = spec.strip_prefix(EVERY_PREFIX) {
			return Ok(Self::Every(parse_duration(interval.trim())?));
		}
		let cron = Cron::from_str(spec)
			.map_err(|e| Error::ValidationError(format!("invalid cron spec '{}': {}", spec, e)))?;
		Ok(Self::Cron(Box::new(cron)))
	}

	/// Next fire time strictly after `after`
	pub fn next_after(&self, after: &DateTime<Tz>) -> CdResult<DateTime<Tz>> {
		match self {
			Self::Cron(cron) => cron
				.find_next_occurrence(after, false)
				.map_err(|e| Error::Internal(format!("no next cron occurrence: {}", e))),
			Self::Every(interval) => {
				let delta = TimeDelta::from_std(*interval)
					.map_err(|e| Error::Internal(format!("interval out of range: {}", e)))?;
				after
					.checked_add_signed(delta)
					.ok_or_else(|| Error::Internal("interval overflows calendar".into()))
			}
		}
	}
}

/// Parse a duration such as `5s`, `1m30s`, `2h` or `250ms`
pub fn parse_duration(input: &str) -> CdResult<Duration> {
	let invalid = || Error::Parse(format!("invalid duration '{}'", input));
	if input.is_empty() {
		return Err(invalid());
	}

	let mut total = Duration::ZERO;
	let mut rest = input;
	while !rest.is_empty() {
		let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
		if digits == 0 {
			return Err(invalid());
		}
		let value: u64 = rest[..digits].parse()?;
		rest = &rest[digits..];

		let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
		let unit = match &rest[..unit_len] {
			"ms" => Duration::from_millis(value),
			"s" => Duration::from_secs(value),
			"m" => Duration::from_secs(value.saturating_mul(60)),
			"h" => Duration::from_secs(value.saturating_mul(3600)),
			_ => return Err(invalid()),
		};
		total = total.saturating_add(unit);
		rest = &rest[unit_len..];
	}

	if total.is_zero() {
		return Err(Error::Parse(format!("duration '{}' must be positive", input)));
	}
	Ok(total)
}

/// Snapshot of a registered entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronEntryInfo {
	pub id: Box<str>,
	pub spec: Box<str>,
	pub task_type: Box<str>,
	pub next: Timestamp,
	pub prev: Option<Timestamp>,
}

struct CronEntry {
	id: Box<str>,
	spec: Box<str>,
	schedule: Schedule,
	task: TaskEnvelope,
	next: DateTime<Tz>,
	prev: Option<DateTime<Tz>>,
}

impl CronEntry {
	fn info(&self) -> CronEntryInfo {
		CronEntryInfo {
			id: self.id.clone(),
			spec: self.spec.clone(),
			task_type: self.task.kind().into(),
			next: Timestamp::from_datetime(&self.next),
			prev: self.prev.as_ref().map(Timestamp::from_datetime),
		}
	}
}

enum Command {
	Register { spec: Box<str>, schedule: Schedule, task: TaskEnvelope, reply: oneshot::Sender<CdResult<Box<str>>> },
	Unregister { id: Box<str>, reply: oneshot::Sender<bool> },
	Update { id: Box<str>, task: TaskEnvelope, reply: oneshot::Sender<bool> },
	Entries { reply: oneshot::Sender<Vec<CronEntryInfo>> },
}

// CronScheduler
//***************
pub struct CronScheduler {
	tx: flume::Sender<Command>,
	timezone: Tz,
	shutdown: CancellationToken,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
	/// Spawn the scheduler loop. Fired entries are enqueued through `client`.
	pub fn start(client: Client, timezone: Tz) -> Self {
		let (tx, rx) = flume::unbounded();
		let shutdown = CancellationToken::new();
		let runner = Runner { client, timezone, rx, shutdown: shutdown.clone(), entries: Vec::new() };
		let handle = tokio::spawn(runner.run());
		Self { tx, timezone, shutdown, handle: Mutex::new(Some(handle)) }
	}

	pub fn timezone(&self) -> Tz {
		self.timezone
	}

	/// Register an entry and return its id
	pub async fn register(&self, spec: &str, task: TaskEnvelope) -> CdResult<Box<str>> {
		let schedule = Schedule::parse(spec)?;
		task.validate()?;
		self.call(|reply| Command::Register { spec: spec.into(), schedule, task, reply }).await?
	}

	/// Remove an entry. Returns `false` if the id was unknown.
	pub async fn unregister(&self, id: &str) -> CdResult<bool> {
		self.call(|reply| Command::Unregister { id: id.into(), reply }).await
	}

	/// Replace the task an entry enqueues, keeping its next fire time
	pub async fn update_task(&self, id: &str, task: TaskEnvelope) -> CdResult<bool> {
		self.call(|reply| Command::Update { id: id.into(), task, reply }).await
	}

	pub async fn entries(&self) -> CdResult<Vec<CronEntryInfo>> {
		self.call(|reply| Command::Entries { reply }).await
	}

	pub async fn shutdown(&self) -> CdResult<()> {
		self.shutdown.cancel();
		let handle = lock!(self.handle, "cron handle")?.take();
		if let Some(handle) = handle {
			handle.await.map_err(|e| Error::Internal(format!("cron loop failed: {}", e)))?;
		}
		Ok(())
	}

	async fn call<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> CdResult<T> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send_async(cmd(reply))
			.await
			.map_err(|_| Error::Internal("cron scheduler stopped".into()))?;
		rx.await.map_err(|_| Error::Internal("cron scheduler stopped".into()))
	}
}

impl std::fmt::Debug for CronScheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CronScheduler").field("timezone", &self.timezone).finish_non_exhaustive()
	}
}

struct Runner {
	client: Client,
	timezone: Tz,
	rx: flume::Receiver<Command>,
	shutdown: CancellationToken,
	entries: Vec<CronEntry>,
}

impl Runner {
	fn now(&self) -> DateTime<Tz> {
		Utc::now().with_timezone(&self.timezone)
	}

	async fn run(mut self) {
		info!("Cron scheduler started ({})", self.timezone);
		loop {
			let wait = self
				.entries
				.iter()
				.map(|e| e.next)
				.min()
				.map(|next| (next - self.now()).to_std().unwrap_or(Duration::ZERO));

			tokio::select! {
				() = self.shutdown.cancelled() => break,
				cmd = self.rx.recv_async() => match cmd {
					Ok(cmd) => self.handle(cmd),
					Err(_) => break,
				},
				() = sleep_for(wait) => self.fire_due().await,
			}
		}
		info!("Cron scheduler stopped");
	}

	fn handle(&mut self, cmd: Command) {
		match cmd {
			Command::Register { spec, schedule, task, reply } => {
				let res = schedule.next_after(&self.now()).map(|next| {
					let id: Box<str> = uuid::Uuid::new_v4().to_string().into();
					info!("Registered cron entry {} [{}] {}", id, spec, task.kind());
					self.entries.push(CronEntry { id: id.clone(), spec, schedule, task, next, prev: None });
					id
				});
				let _ignore = reply.send(res);
			}
			Command::Unregister { id, reply } => {
				let before = self.entries.len();
				self.entries.retain(|e| e.id != id);
				let removed = self.entries.len() != before;
				if removed {
					info!("Unregistered cron entry {}", id);
				}
				let _ignore = reply.send(removed);
			}
			Command::Update { id, task, reply } => {
				let entry = self.entries.iter_mut().find(|e| e.id == id);
				let found = entry.is_some();
				if let Some(entry) = entry {
					debug!("Updated task of cron entry {}", id);
					entry.task = task;
				}
				let _ignore = reply.send(found);
			}
			Command::Entries { reply } => {
				let _ignore = reply.send(self.entries.iter().map(CronEntry::info).collect());
			}
		}
	}

	async fn fire_due(&mut self) {
		let now = self.now();
		let mut failed = Vec::new();

		for entry in self.entries.iter_mut().filter(|e| e.next <= now) {
			match self.client.enqueue(entry.task.clone()).await {
				Ok(info) => debug!("Cron entry {} enqueued task {}", entry.id, info.id),
				Err(e) => error!("Cron entry {} failed to enqueue {}: {}", entry.id, entry.task.kind(), e),
			}
			entry.prev = Some(entry.next);
			match entry.schedule.next_after(&now) {
				Ok(next) => entry.next = next,
				Err(e) => {
					error!("Dropping cron entry {} [{}]: {}", entry.id, entry.spec, e);
					failed.push(entry.id.clone());
				}
			}
		}

		if !failed.is_empty() {
			self.entries.retain(|e| !failed.contains(&e.id));
		}
	}
}

async fn sleep_for(wait: Option<Duration>) {
	match wait {
		Some(wait) => tokio::time::sleep(wait).await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{MemoryQueueStore, QueueStore};
	use chrono::TimeZone;

	#[test]
	fn test_parse_duration() -> CdResult<()> {
		assert_eq!(parse_duration("5s")?, Duration::from_secs(5));
		assert_eq!(parse_duration("1m30s")?, Duration::from_secs(90));
		assert_eq!(parse_duration("2h")?, Duration::from_secs(7200));
		assert_eq!(parse_duration("250ms")?, Duration::from_millis(250));
		assert!(parse_duration("").is_err());
		assert!(parse_duration("10").is_err());
		assert!(parse_duration("s").is_err());
		assert!(parse_duration("5d").is_err());
		assert!(parse_duration("0s").is_err());
		Ok(())
	}

	#[test]
	fn test_schedule_parse() {
		assert!(matches!(Schedule::parse("@every 10s"), Ok(Schedule::Every(d)) if d == Duration::from_secs(10)));
		assert!(matches!(Schedule::parse("*/5 * * * *"), Ok(Schedule::Cron(_))));
		assert!(matches!(Schedule::parse("@hourly"), Ok(Schedule::Cron(_))));
		assert!(Schedule::parse("not a cron").is_err());
		assert!(Schedule::parse("@every soon").is_err());
	}

	#[test]
	fn test_cron_next_in_timezone() -> CdResult<()> {
		let tz: Tz = chrono_tz::America::New_York;
		let schedule = Schedule::parse("0 9 * * *")?;
		let after = tz.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single().ok_or(Error::NotFound)?;
		let next = schedule.next_after(&after)?;
		assert_eq!(next, tz.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).single().ok_or(Error::NotFound)?);
		Ok(())
	}

	#[test]
	fn test_every_next() -> CdResult<()> {
		let tz: Tz = chrono_tz::UTC;
		let after = tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().ok_or(Error::NotFound)?;
		let next = Schedule::parse("@every 1m30s")?.next_after(&after)?;
		assert_eq!(next - after, TimeDelta::seconds(90));
		Ok(())
	}

	#[tokio::test]
	async fn test_register_update_unregister() -> CdResult<()> {
		let store = MemoryQueueStore::new();
		let cron = CronScheduler::start(Client::new(store), chrono_tz::UTC);

		let id = cron.register("@every 1h", TaskEnvelope::new("report", b"v1".to_vec())).await?;
		let entries = cron.entries().await?;
		assert_eq!(entries.len(), 1);
		assert_eq!(&*entries[0].task_type, "report");
		let next = entries[0].next;

		assert!(cron.update_task(&id, TaskEnvelope::new("report", b"v2".to_vec())).await?);
		assert_eq!(cron.entries().await?[0].next, next);

		assert!(cron.unregister(&id).await?);
		assert!(!cron.unregister(&id).await?);
		assert!(cron.entries().await?.is_empty());

		assert!(cron.register("bogus", TaskEnvelope::new("report", Vec::new())).await.is_err());
		cron.shutdown().await?;
		assert!(cron.entries().await.is_err());
		Ok(())
	}

	#[tokio::test]
	async fn test_entry_fires_into_queue() -> CdResult<()> {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
		let store = MemoryQueueStore::new();
		let cron = CronScheduler::start(Client::new(store.clone()), chrono_tz::UTC);

		let task = TaskEnvelope::new("tick", Vec::new())
			.with_options(TaskOptions::default().queue("cron"));
		cron.register("@every 1s", task).await?;

		tokio::time::sleep(Duration::from_millis(2300)).await;
		let fired = store.list("cron").await?;
		assert!((1..=3).contains(&fired.len()), "fired {} times", fired.len());
		assert!(cron.entries().await?[0].prev.is_some());

		cron.shutdown().await?;
		Ok(())
	}
}

// vim: ts=4
