//! Dispatcher. A fixed pool of workers pulls ready tasks from weighted queues,
//! runs the matching handler under the attempt's deadline and routes the
//! outcome through the retry policy.

use futures::FutureExt;
use rand::RngExt;
use std::{
	panic::AssertUnwindSafe,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::handler::{HandlerError, HandlerRegistry, TaskContext};
use crate::prelude::*;
use crate::retry::{ArchiveReason, RetryDecision, RetryPolicy};
use crate::store::{QueueStore, TaskRecord};

const OUTCOME_BUFFER: usize = 1024;
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
	/// Number of tasks processed concurrently
	pub concurrency: usize,
	/// Queue names and their relative weights
	pub queues: Vec<(Box<str>, u32)>,
	pub retry: RetryPolicy,
	/// Idle wait between polls when no task is ready
	pub poll_interval: Duration,
	/// How long a claimed task stays reserved without a renewal
	pub lease: Duration,
	/// Interval of orphan recovery and retention purges
	pub purge_interval: Duration,
	/// Grace period for in-flight handlers on shutdown
	pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			concurrency: 10,
			queues: vec![("default".into(), 1)],
			retry: RetryPolicy::default(),
			poll_interval: Duration::from_secs(1),
			lease: Duration::from_secs(30),
			purge_interval: Duration::from_secs(60),
			shutdown_timeout: Duration::from_secs(8),
		}
	}
}

/// Published after every processed attempt
#[derive(Clone, Debug)]
pub struct TaskOutcome {
	pub id: Box<str>,
	pub task_type: Box<str>,
	pub queue: Box<str>,
	/// State the task moved to
	pub state: TaskState,
	pub error: Option<String>,
	pub attempt: u32,
}

// QueueSelector
//***************
/// Soft-priority queue ordering: a queue with weight `w` comes first `w / total` of the time
#[derive(Debug)]
pub struct QueueSelector {
	queues: Vec<(Box<str>, u32)>,
}

impl QueueSelector {
	pub fn new(queues: &[(Box<str>, u32)]) -> CdResult<Self> {
		if queues.is_empty() {
			return Err(Error::ConfigError("at least one queue must be configured".into()));
		}
		if let Some((name, _)) = queues.iter().find(|(_, w)| *w == 0) {
			return Err(Error::ConfigError(format!("queue {} has zero weight", name)));
		}
		Ok(Self { queues: queues.to_vec() })
	}

	/// All queue names in weighted-random order (sampling without replacement)
	pub fn order(&self) -> Vec<&str> {
		let mut rng = rand::rng();
		let mut remaining: Vec<&(Box<str>, u32)> = self.queues.iter().collect();
		let mut order = Vec::with_capacity(remaining.len());

		while !remaining.is_empty() {
			let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
			let mut pick = rng.random_range(0..total);
			let idx = remaining
				.iter()
				.position(|(_, w)| {
					let w = u64::from(*w);
					if pick < w {
						true
					} else {
						pick -= w;
						false
					}
				})
				.unwrap_or(0);
			order.push(&*remaining.remove(idx).0);
		}
		order
	}
}

enum Attempt {
	Finished(Result<(), HandlerError>),
	Interrupted,
}

// Dispatcher
//************
pub struct Dispatcher {
	store: Arc<dyn QueueStore>,
	registry: HandlerRegistry,
	selector: QueueSelector,
	config: DispatcherConfig,
	shutdown: CancellationToken,
	handles: Mutex<Vec<JoinHandle<()>>>,
	tx_outcome: flume::Sender<TaskOutcome>,
	rx_outcome: flume::Receiver<TaskOutcome>,
}

impl Dispatcher {
	pub fn new(
		store: Arc<dyn QueueStore>,
		registry: HandlerRegistry,
		config: DispatcherConfig,
	) -> CdResult<Arc<Self>> {
		if config.concurrency == 0 {
			return Err(Error::ConfigError("concurrency must be at least 1".into()));
		}
		if config.lease.is_zero() {
			return Err(Error::ConfigError("lease must be positive".into()));
		}
		let selector = QueueSelector::new(&config.queues)?;
		let (tx_outcome, rx_outcome) = flume::bounded(OUTCOME_BUFFER);

		Ok(Arc::new(Self {
			store,
			registry,
			selector,
			config,
			shutdown: CancellationToken::new(),
			handles: Mutex::new(Vec::new()),
			tx_outcome,
			rx_outcome,
		}))
	}

	/// Receive attempt outcomes. Outcomes are dropped while the buffer is full.
	pub fn outcomes(&self) -> flume::Receiver<TaskOutcome> {
		self.rx_outcome.clone()
	}

	pub fn start(self: &Arc<Self>) -> CdResult<()> {
		let mut handles = lock!(self.handles, "handles")?;
		if !handles.is_empty() {
			return Err(Error::Internal("dispatcher already started".into()));
		}
		info!(
			"Starting dispatcher: concurrency={} queues={:?} handlers={:?}",
			self.config.concurrency,
			self.config.queues,
			self.registry.kinds()
		);

		for worker in 0..self.config.concurrency {
			let dispatcher = Arc::clone(self);
			handles.push(tokio::spawn(async move { dispatcher.worker_loop(worker).await }));
		}

		let dispatcher = Arc::clone(self);
		handles.push(tokio::spawn(async move { dispatcher.janitor_loop().await }));
		Ok(())
	}

	/// Stop pulling new tasks, give in-flight handlers the grace period, then
	/// re-queue whatever is still running.
	pub async fn shutdown(&self) -> CdResult<()> {
		info!("Dispatcher shutting down");
		self.shutdown.cancel();
		let handles: Vec<JoinHandle<()>> = lock!(self.handles, "handles")?.drain(..).collect();
		let wait = self.config.shutdown_timeout + Duration::from_secs(1);
		for handle in handles {
			match tokio::time::timeout(wait, handle).await {
				Ok(Ok(())) => (),
				Ok(Err(e)) => error!("Worker task failed: {}", e),
				Err(_) => warn!("Worker did not stop within {:?}", wait),
			}
		}
		Ok(())
	}

	async fn worker_loop(&self, worker: usize) {
		debug!("Worker {} started", worker);
		while !self.shutdown.is_cancelled() {
			match self.process_next().await {
				Ok(true) => continue,
				Ok(false) => (),
				Err(e) => warn!("Worker {}: dequeue failed: {}", worker, e),
			}
			tokio::select! {
				() = self.shutdown.cancelled() => break,
				() = tokio::time::sleep(self.config.poll_interval) => (),
			}
		}
		debug!("Worker {} stopped", worker);
	}

	async fn janitor_loop(&self) {
		loop {
			tokio::select! {
				() = self.shutdown.cancelled() => break,
				() = tokio::time::sleep(self.config.purge_interval) => (),
			}
			self.maintain().await;
		}
	}

	/// Re-queue tasks whose worker lost its lease, then purge expired records
	pub async fn maintain(&self) {
		let now = Timestamp::now();
		match self.store.recover_orphans(now).await {
			Ok(0) => (),
			Ok(n) => info!("Recovered {} orphaned tasks", n),
			Err(e) => warn!("Orphan recovery failed: {}", e),
		}
		if let Err(e) = self.store.purge_expired(now).await {
			warn!("Purging finished tasks failed: {}", e);
		}
	}

	async fn renew_lease(&self, id: &str) {
		match self.store.extend_lease(id, Timestamp::from_now(self.config.lease)).await {
			Ok(true) => (),
			Ok(false) => warn!("Lease lost, task may be dispatched again"),
			Err(e) => warn!("Lease renewal failed: {}", e),
		}
	}

	/// Claim and process one ready task. Returns `false` when nothing was ready.
	pub async fn process_next(&self) -> CdResult<bool> {
		let order = self.selector.order();
		let Some(task) = self.store.dequeue(&order, self.config.lease).await? else {
			return Ok(false);
		};
		let span = info_span!(
			"task",
			id = %task.id,
			task_type = %task.envelope.kind(),
			queue = %task.envelope.options().queue
		);
		self.process(task).instrument(span).await;
		Ok(true)
	}

	async fn process(&self, task: TaskRecord) {
		let kind = task.envelope.kind();
		let Some(handler) = self.registry.get(kind) else {
			let err = Error::NoHandler(kind.into());
			error!("{}", err);
			let msg = format!("{}: {}", ArchiveReason::NoHandler, err);
			self.transition(&task, TaskState::Archived, Some(msg)).await;
			return;
		};

		let started = task.started_at.unwrap_or_else(Timestamp::now);
		let opts = task.envelope.options();
		let deadline = opts.effective_deadline(started);
		let ctx = TaskContext::new(
			task.id.clone(),
			opts.queue.clone(),
			task.retried,
			opts.max_retries,
			deadline,
		);

		debug!("Processing attempt {}", task.attempts);
		let attempt = {
			let fut = AssertUnwindSafe(handler.process(&ctx, &task.envelope)).catch_unwind();
			tokio::pin!(fut);
			let mut renew = tokio::time::interval((self.config.lease / 3).max(MIN_RENEW_INTERVAL));
			renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			// first tick completes immediately, the lease was just granted
			renew.tick().await;
			let outcome = loop {
				tokio::select! {
					res = &mut fut => break Some(res),
					() = sleep_until(deadline) => {
						ctx.cancel();
						break Some(Ok(Err(HandlerError::Cancelled)));
					}
					() = self.shutdown.cancelled() => break None,
					_ = renew.tick() => self.renew_lease(&task.id).await,
				}
			};
			match outcome {
				Some(res) => Attempt::Finished(flatten_panic(res)),
				None => match tokio::time::timeout(self.config.shutdown_timeout, &mut fut).await {
					Ok(res) => Attempt::Finished(flatten_panic(res)),
					Err(_) => {
						ctx.cancel();
						Attempt::Interrupted
					}
				},
			}
		};

		match attempt {
			Attempt::Finished(Ok(())) => {
				info!("Task completed");
				self.transition(&task, TaskState::Completed, None).await;
			}
			Attempt::Finished(Err(err)) => self.handle_failure(&task, &err).await,
			Attempt::Interrupted => {
				warn!("Task interrupted by shutdown, re-queueing");
				if let Err(e) = self.store.requeue(&task.id).await {
					error!("Failed to re-queue interrupted task: {}", e);
				}
				self.publish(&task, TaskState::Pending, Some("interrupted by shutdown".into()));
			}
		}
	}

	async fn handle_failure(&self, task: &TaskRecord, err: &HandlerError) {
		match self.config.retry.decide(err, task.retried, &task.envelope) {
			RetryDecision::Retry { delay, is_failure } => {
				if is_failure {
					warn!(
						"Task failed (retry {}/{}), retrying in {:?}: {}",
						task.retried + 1,
						task.envelope.options().max_retries,
						delay,
						err
					);
				} else {
					info!("Task deferred, retrying in {:?}: {}", delay, err);
				}
				let msg = err.to_string();
				let next_at = Timestamp::from_now(delay);
				if let Err(e) = self.store.retry(&task.id, next_at, &msg, is_failure).await {
					error!("Failed to schedule retry: {}", e);
				}
				self.publish(task, TaskState::Retry, Some(msg));
			}
			RetryDecision::Archive(reason) => {
				error!("Task archived ({}): {}", reason, err);
				let msg = format!("{}: {}", reason, err);
				self.transition(task, TaskState::Archived, Some(msg)).await;
			}
		}
	}

	async fn transition(&self, task: &TaskRecord, state: TaskState, error: Option<String>) {
		let res = match (state, &error) {
			(TaskState::Completed, _) => self.store.complete(&task.id).await,
			(TaskState::Archived, Some(msg)) => self.store.archive(&task.id, msg).await,
			_ => Err(Error::Internal(format!("unsupported transition to {}", state))),
		};
		if let Err(e) = res {
			error!("Failed to mark task {}: {}", state, e);
		}
		self.publish(task, state, error);
	}

	fn publish(&self, task: &TaskRecord, state: TaskState, error: Option<String>) {
		let outcome = TaskOutcome {
			id: task.id.clone(),
			task_type: task.envelope.kind().into(),
			queue: task.envelope.options().queue.clone(),
			state,
			error,
			attempt: task.attempts,
		};
		if self.tx_outcome.try_send(outcome).is_err() {
			debug!("Outcome buffer full, dropping outcome");
		}
	}
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dispatcher")
			.field("config", &self.config)
			.field("registry", &self.registry)
			.field("stopped", &self.shutdown.is_cancelled())
			.finish_non_exhaustive()
	}
}

async fn sleep_until(deadline: Option<Timestamp>) {
	match deadline {
		Some(deadline) => tokio::time::sleep(deadline.until()).await,
		None => std::future::pending().await,
	}
}

fn flatten_panic(
	res: Result<Result<(), HandlerError>, Box<dyn std::any::Any + Send>>,
) -> Result<(), HandlerError> {
	res.unwrap_or_else(|panic| {
		let msg = panic
			.downcast_ref::<&str>()
			.map(|s| (*s).to_string())
			.or_else(|| panic.downcast_ref::<String>().cloned())
			.unwrap_or_else(|| "unknown panic".into());
		error!("Handler panicked: {}", msg);
		Err(HandlerError::Failed(format!("handler panicked: {}", msg)))
	})
}


// vim: ts=4
