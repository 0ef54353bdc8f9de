//! Periodic task manager. Keeps the cron scheduler's entries converged to the
//! schedule set returned by a config provider.

use async_trait::async_trait;
use chrono_tz::Tz;
use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
	time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::cron::{CronEntryInfo, CronScheduler};
use crate::prelude::*;
use cadence_types::task::DEFAULT_QUEUE;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const DEFAULT_CRON_QUEUE: &str = "cron";

/// One desired cron registration with the ids batched into its task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleConfig {
	pub task_type: Box<str>,
	pub cron_spec: Box<str>,
	pub ids: Vec<String>,
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
	async fn get_configs(&self) -> CdResult<Vec<ScheduleConfig>>;
}

/// Builds the task for a schedule from its id batch
pub type TaskBuilderFn = dyn Fn(&[String]) -> CdResult<TaskEnvelope> + Send + Sync;

#[derive(Clone, Debug)]
pub struct PeriodicTaskManagerOpts {
	pub sync_interval: Duration,
	/// Zone every cron spec is evaluated in
	pub timezone: Tz,
	/// Queue used for tasks whose builder left the default queue
	pub queue: Box<str>,
}

impl Default for PeriodicTaskManagerOpts {
	fn default() -> Self {
		Self {
			sync_interval: DEFAULT_SYNC_INTERVAL,
			timezone: chrono_tz::America::New_York,
			queue: DEFAULT_CRON_QUEUE.into(),
		}
	}
}

/// Resolve an IANA zone name
pub fn load_timezone(name: &str) -> CdResult<Tz> {
	name.parse::<Tz>()
		.map_err(|e| Error::ConfigError(format!("cannot load timezone '{}': {}", name, e)))
}

/// Changes applied by one sync
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
	pub added: usize,
	pub removed: usize,
	pub updated: usize,
	pub unchanged: usize,
	pub skipped: usize,
}

type EntryKey = (Box<str>, Box<str>);

#[derive(Debug)]
struct Registered {
	entry_id: Box<str>,
	task: TaskEnvelope,
}

// PeriodicTaskManagerBuilder
//****************************
pub struct PeriodicTaskManagerBuilder {
	provider: Arc<dyn ConfigProvider>,
	client: Client,
	opts: PeriodicTaskManagerOpts,
	builders: HashMap<Box<str>, Arc<TaskBuilderFn>>,
}

impl PeriodicTaskManagerBuilder {
	pub fn opts(mut self, opts: PeriodicTaskManagerOpts) -> Self {
		self.opts = opts;
		self
	}

	/// Register how tasks of `task_type` are built from an id batch
	pub fn task<F>(mut self, task_type: impl Into<Box<str>>, builder: F) -> Self
	where
		F: Fn(&[String]) -> CdResult<TaskEnvelope> + Send + Sync + 'static,
	{
		let task_type = task_type.into();
		debug!("Registering periodic task type {}", task_type);
		self.builders.insert(task_type, Arc::new(builder));
		self
	}

	/// Start the underlying cron scheduler. Requires a running tokio runtime.
	pub fn build(self) -> Arc<PeriodicTaskManager> {
		let scheduler = CronScheduler::start(self.client, self.opts.timezone);
		Arc::new(PeriodicTaskManager {
			provider: self.provider,
			scheduler,
			builders: self.builders,
			opts: self.opts,
			registered: tokio::sync::Mutex::new(HashMap::new()),
			shutdown: CancellationToken::new(),
		})
	}
}

// PeriodicTaskManager
//*********************
pub struct PeriodicTaskManager {
	provider: Arc<dyn ConfigProvider>,
	scheduler: CronScheduler,
	builders: HashMap<Box<str>, Arc<TaskBuilderFn>>,
	opts: PeriodicTaskManagerOpts,
	registered: tokio::sync::Mutex<HashMap<EntryKey, Registered>>,
	shutdown: CancellationToken,
}

impl PeriodicTaskManager {
	pub fn builder(provider: Arc<dyn ConfigProvider>, client: Client) -> PeriodicTaskManagerBuilder {
		PeriodicTaskManagerBuilder {
			provider,
			client,
			opts: PeriodicTaskManagerOpts::default(),
			builders: HashMap::new(),
		}
	}

	pub fn opts(&self) -> &PeriodicTaskManagerOpts {
		&self.opts
	}

	pub fn scheduler(&self) -> &CronScheduler {
		&self.scheduler
	}

	pub async fn entries(&self) -> CdResult<Vec<CronEntryInfo>> {
		self.scheduler.entries().await
	}

	/// Build the desired entry set, merging ids of configs sharing a key
	fn desired(&self, configs: Vec<ScheduleConfig>, report: &mut SyncReport) -> HashMap<EntryKey, TaskEnvelope> {
		let mut merged: BTreeMap<EntryKey, Vec<String>> = BTreeMap::new();
		for config in configs {
			merged.entry((config.task_type, config.cron_spec)).or_default().extend(config.ids);
		}

		let mut desired = HashMap::with_capacity(merged.len());
		for ((task_type, cron_spec), ids) in merged {
			let Some(builder) = self.builders.get(&task_type) else {
				warn!("Unknown periodic task type {}, skipping", task_type);
				report.skipped += 1;
				continue;
			};
			let task = match builder(ids.as_slice()) {
				Ok(task) => task,
				Err(e) => {
					warn!("Cannot build {} task for [{}]: {}", task_type, cron_spec, e);
					report.skipped += 1;
					continue;
				}
			};
			let task = if &*task.options().queue == DEFAULT_QUEUE {
				let opts = task.options().clone().queue(self.opts.queue.clone());
				task.with_options(opts)
			} else {
				task
			};
			desired.insert((task_type, cron_spec), task);
		}
		desired
	}

	/// Fetch the configs once and converge the registered entries to them.
	/// On provider failure the current entries stay untouched.
	pub async fn sync(&self) -> CdResult<SyncReport> {
		let configs = self.provider.get_configs().await.inspect_err(|e| {
			error!("Failed to fetch schedule configs, keeping current entries: {}", e);
		})?;

		let mut report = SyncReport::default();
		let mut desired = self.desired(configs, &mut report);
		let mut registered = self.registered.lock().await;

		let stale: Vec<EntryKey> = registered.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
		for key in stale {
			let Some(entry_id) = registered.get(&key).map(|e| e.entry_id.clone()) else { continue };
			info!("Removing schedule {} [{}]", key.0, key.1);
			// stays tracked until the scheduler confirms, so a failed removal is retried
			self.scheduler.unregister(&entry_id).await?;
			registered.remove(&key);
			report.removed += 1;
		}

		for (key, current) in registered.iter_mut() {
			let Some(task) = desired.remove(key) else { continue };
			if task == current.task {
				report.unchanged += 1;
			} else {
				debug!("Refreshing task of schedule {} [{}]", key.0, key.1);
				self.scheduler.update_task(&current.entry_id, task.clone()).await?;
				current.task = task;
				report.updated += 1;
			}
		}

		for (key, task) in desired {
			match self.scheduler.register(&key.1, task.clone()).await {
				Ok(entry_id) => {
					info!("Added schedule {} [{}] as {}", key.0, key.1, entry_id);
					registered.insert(key, Registered { entry_id, task });
					report.added += 1;
				}
				Err(e) => {
					warn!("Cannot register schedule {} [{}]: {}", key.0, key.1, e);
					report.skipped += 1;
				}
			}
		}

		debug!("Schedule sync: {:?}", report);
		Ok(report)
	}

	/// Sync on every interval until shut down. Ticks never overlap.
	pub async fn run(&self) {
		info!(
			"Periodic task manager started: interval={:?} timezone={}",
			self.opts.sync_interval, self.opts.timezone
		);
		let mut interval = tokio::time::interval(self.opts.sync_interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				() = self.shutdown.cancelled() => break,
				_ = interval.tick() => (),
			}
			// errors are already logged, the next tick retries
			let _ignore = self.sync().await;
		}
		info!("Periodic task manager stopped");
	}

	pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
		let manager = Arc::clone(self);
		tokio::spawn(async move { manager.run().await })
	}

	pub async fn shutdown(&self) -> CdResult<()> {
		self.shutdown.cancel();
		self.scheduler.shutdown().await
	}
}

impl std::fmt::Debug for PeriodicTaskManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PeriodicTaskManager")
			.field("opts", &self.opts)
			.field("task_types", &self.builders.keys().collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{MemoryQueueStore, QueueStore};
	use parking_lot::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// Provider returning whatever the test set last; `None` simulates an outage
	#[derive(Default)]
	struct StaticProvider {
		configs: Mutex<Option<Vec<ScheduleConfig>>>,
	}

	impl StaticProvider {
		fn set(&self, configs: Option<Vec<ScheduleConfig>>) {
			*self.configs.lock() = configs;
		}
	}

	#[async_trait]
	impl ConfigProvider for StaticProvider {
		async fn get_configs(&self) -> CdResult<Vec<ScheduleConfig>> {
			self.configs.lock().clone().ok_or_else(|| Error::StoreUnavailable("kv down".into()))
		}
	}

	fn config(task_type: &str, spec: &str, ids: &[&str]) -> ScheduleConfig {
		ScheduleConfig {
			task_type: task_type.into(),
			cron_spec: spec.into(),
			ids: ids.iter().map(ToString::to_string).collect(),
		}
	}

	fn batch(kind: &'static str) -> impl Fn(&[String]) -> CdResult<TaskEnvelope> + Send + Sync {
		move |ids: &[String]| TaskEnvelope::json(kind, &ids)
	}

	fn manager(provider: Arc<StaticProvider>) -> Arc<PeriodicTaskManager> {
		let store = MemoryQueueStore::new();
		PeriodicTaskManager::builder(provider, Client::new(store))
			.opts(PeriodicTaskManagerOpts { timezone: chrono_tz::UTC, ..Default::default() })
			.task("A", batch("A"))
			.task("B", batch("B"))
			.task("C", batch("C"))
			.build()
	}

	async fn entry_for(manager: &PeriodicTaskManager, task_type: &str) -> CdResult<Option<CronEntryInfo>> {
		Ok(manager.entries().await?.into_iter().find(|e| &*e.task_type == task_type))
	}

	#[test]
	fn test_load_timezone() {
		assert_eq!(load_timezone("America/New_York").ok(), Some(chrono_tz::America::New_York));
		assert!(matches!(load_timezone("Mars/Olympus_Mons"), Err(Error::ConfigError(_))));
	}

	#[tokio::test]
	async fn test_sync_converges() -> CdResult<()> {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
		let provider = Arc::new(StaticProvider::default());
		let manager = manager(provider.clone());

		provider.set(Some(vec![config("A", "* * * * *", &["1"]), config("B", "@every 5s", &["2"])]));
		let report = manager.sync().await?;
		assert_eq!(report.added, 2);
		let b_before = entry_for(&manager, "B").await?.ok_or(Error::NotFound)?;

		tokio::time::sleep(Duration::from_millis(50)).await;
		provider.set(Some(vec![config("B", "@every 5s", &["2"]), config("C", "@every 10s", &["3"])]));
		let report = manager.sync().await?;
		assert_eq!(report, SyncReport { added: 1, removed: 1, updated: 0, unchanged: 1, skipped: 0 });

		assert!(entry_for(&manager, "A").await?.is_none());
		assert!(entry_for(&manager, "C").await?.is_some());
		let b_after = entry_for(&manager, "B").await?.ok_or(Error::NotFound)?;
		assert_eq!(b_after.id, b_before.id);
		assert_eq!(b_after.next, b_before.next);

		manager.shutdown().await
	}

	#[tokio::test]
	async fn test_changed_ids_refresh_without_reset() -> CdResult<()> {
		let provider = Arc::new(StaticProvider::default());
		let manager = manager(provider.clone());

		provider.set(Some(vec![config("B", "@every 1h", &["x"])]));
		manager.sync().await?;
		let before = entry_for(&manager, "B").await?.ok_or(Error::NotFound)?;

		provider.set(Some(vec![config("B", "@every 1h", &["x", "y"])]));
		let report = manager.sync().await?;
		assert_eq!(report.updated, 1);
		let after = entry_for(&manager, "B").await?.ok_or(Error::NotFound)?;
		assert_eq!((after.id, after.next), (before.id, before.next));

		manager.shutdown().await
	}

	#[tokio::test]
	async fn test_provider_failure_keeps_entries() -> CdResult<()> {
		let provider = Arc::new(StaticProvider::default());
		let manager = manager(provider.clone());

		provider.set(Some(vec![config("A", "@every 1m", &["1"])]));
		manager.sync().await?;
		provider.set(None);
		assert!(manager.sync().await.is_err());
		assert_eq!(manager.entries().await?.len(), 1);

		manager.shutdown().await
	}

	#[tokio::test]
	async fn test_failed_unregister_keeps_entry_tracked() -> CdResult<()> {
		let provider = Arc::new(StaticProvider::default());
		let manager = manager(provider.clone());

		provider.set(Some(vec![config("A", "@every 1m", &["1"])]));
		manager.sync().await?;
		manager.scheduler().shutdown().await?;

		provider.set(Some(Vec::new()));
		assert!(manager.sync().await.is_err());
		assert_eq!(manager.registered.lock().await.len(), 1);
		// the removal is attempted again instead of being forgotten
		assert!(manager.sync().await.is_err());
		assert_eq!(manager.registered.lock().await.len(), 1);
		Ok(())
	}

	/// Provider slower than the sync interval, tracking concurrent calls
	#[derive(Default)]
	struct SlowProvider {
		active: AtomicUsize,
		max_active: AtomicUsize,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl ConfigProvider for SlowProvider {
		async fn get_configs(&self) -> CdResult<Vec<ScheduleConfig>> {
			let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_active.fetch_max(active, Ordering::SeqCst);
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(150)).await;
			self.active.fetch_sub(1, Ordering::SeqCst);
			Ok(vec![config("A", "@every 1h", &["1"])])
		}
	}

	#[tokio::test]
	async fn test_slow_provider_ticks_do_not_overlap() -> CdResult<()> {
		let provider = Arc::new(SlowProvider::default());
		let manager = PeriodicTaskManager::builder(provider.clone(), Client::new(MemoryQueueStore::new()))
			.opts(PeriodicTaskManagerOpts {
				sync_interval: Duration::from_millis(50),
				timezone: chrono_tz::UTC,
				..Default::default()
			})
			.task("A", batch("A"))
			.build();

		let handle = manager.start();
		tokio::time::sleep(Duration::from_millis(500)).await;
		manager.shutdown().await?;
		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::Internal(e.to_string()))?;

		assert_eq!(provider.max_active.load(Ordering::SeqCst), 1);
		let calls = provider.calls.load(Ordering::SeqCst);
		// missed ticks are skipped, not queued up behind the slow sync
		assert!((2..=5).contains(&calls), "calls={}", calls);
		Ok(())
	}

	#[tokio::test]
	async fn test_unknown_type_and_bad_spec_skipped() -> CdResult<()> {
		let provider = Arc::new(StaticProvider::default());
		let manager = manager(provider.clone());

		provider.set(Some(vec![
			config("A", "@every 1m", &["1"]),
			config("Z", "@every 1m", &["2"]),
			config("B", "every now and then", &["3"]),
		]));
		let report = manager.sync().await?;
		assert_eq!((report.added, report.skipped), (1, 2));
		assert_eq!(manager.entries().await?.len(), 1);

		manager.shutdown().await
	}

	#[tokio::test]
	async fn test_duplicate_keys_merge_into_one_entry() -> CdResult<()> {
		let store = MemoryQueueStore::new();
		let provider = Arc::new(StaticProvider::default());
		let manager = PeriodicTaskManager::builder(provider.clone(), Client::new(store.clone()))
			.opts(PeriodicTaskManagerOpts { timezone: chrono_tz::UTC, ..Default::default() })
			.task("A", batch("A"))
			.build();

		provider.set(Some(vec![config("A", "@every 1s", &["1"]), config("A", "@every 1s", &["2"])]));
		manager.sync().await?;
		assert_eq!(manager.entries().await?.len(), 1);

		tokio::time::sleep(Duration::from_millis(1300)).await;
		let fired = store.list(DEFAULT_CRON_QUEUE).await?;
		assert!(!fired.is_empty());
		let ids: Vec<String> = fired[0].envelope.decode()?;
		assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);

		manager.shutdown().await
	}
}

// vim: ts=4
