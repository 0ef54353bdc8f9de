//! Event fan-out. `event:start` / `event:stop` tasks carry a batch of ids and
//! enqueue one `event:aws` task per id; the `event:aws` handler is throttled by
//! a shared rate limiter.
//!
//! Each downstream task carries a unique key derived from the batch task's id,
//! so a retried batch skips the ids it already enqueued.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
	fmt,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use crate::client::Client;
use crate::handler::{Handler, HandlerError, HandlerRegistryBuilder, TaskContext};
use crate::prelude::*;
use crate::rate_limit::RateLimiter;

pub const TYPE_EVENT_START: &str = "event:start";
pub const TYPE_EVENT_STOP: &str = "event:stop";
pub const TYPE_EVENT_AWS: &str = "event:aws";

/// Queue shared by all downstream `event:aws` tasks
pub const AWS_QUEUE: &str = "aws";

/// Finished downstream tasks keep their unique key this long, covering the
/// retries of the batch that enqueued them
pub const FAN_OUT_DEDUP_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
	Start,
	Stop,
}

impl EventAction {
	pub fn task_type(self) -> &'static str {
		match self {
			EventAction::Start => TYPE_EVENT_START,
			EventAction::Stop => TYPE_EVENT_STOP,
		}
	}
}

impl fmt::Display for EventAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			EventAction::Start => "start",
			EventAction::Stop => "stop",
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatchPayload {
	pub ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsEventPayload {
	pub id: String,
	pub action: EventAction,
}

pub fn build_event_start(ids: &[String]) -> CdResult<TaskEnvelope> {
	TaskEnvelope::json(TYPE_EVENT_START, &EventBatchPayload { ids: ids.to_vec() })
}

pub fn build_event_stop(ids: &[String]) -> CdResult<TaskEnvelope> {
	TaskEnvelope::json(TYPE_EVENT_STOP, &EventBatchPayload { ids: ids.to_vec() })
}

pub fn build_aws_event(id: &str, action: EventAction) -> CdResult<TaskEnvelope> {
	let task = TaskEnvelope::json(TYPE_EVENT_AWS, &AwsEventPayload { id: id.into(), action })?;
	let opts = task.options().clone().queue(AWS_QUEUE);
	Ok(task.with_options(opts))
}

fn fan_out_key(batch_id: &str, action: EventAction, id: &str) -> String {
	format!("{}:{}:{}:{}", TYPE_EVENT_AWS, batch_id, action, id)
}

// FanOutHandler
//***************
/// Enqueues one downstream task per id of the batch
pub struct FanOutHandler {
	client: Client,
	action: EventAction,
}

impl FanOutHandler {
	pub fn new(client: Client, action: EventAction) -> Self {
		Self { client, action }
	}
}

#[async_trait]
impl Handler for FanOutHandler {
	async fn process(&self, ctx: &TaskContext, task: &TaskEnvelope) -> Result<(), HandlerError> {
		let batch: EventBatchPayload = task.decode().map_err(HandlerError::skip_retry)?;
		info!("Fanning out {} event for {} ids", self.action, batch.ids.len());

		for id in &batch.ids {
			if ctx.is_cancelled() {
				return Err(HandlerError::Cancelled);
			}
			let next = build_aws_event(id, self.action).map_err(HandlerError::skip_retry)?;
			let opts = next
				.options()
				.clone()
				.unique_key(fan_out_key(&ctx.id, self.action, id))
				.retention(FAN_OUT_DEDUP_WINDOW);
			match self.client.enqueue(next.with_options(opts)).await {
				Ok(info) => debug!("Enqueued {} for {} as {}", TYPE_EVENT_AWS, id, info.id),
				Err(Error::DuplicateTask(_)) => debug!("{} for {} already enqueued", TYPE_EVENT_AWS, id),
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}

// AwsEventHandler
//*****************
/// Processes one id under the shared rate limit
pub struct AwsEventHandler {
	limiter: Arc<RateLimiter>,
	processed: AtomicU64,
}

impl AwsEventHandler {
	pub fn new(limiter: Arc<RateLimiter>) -> Self {
		Self { limiter, processed: AtomicU64::new(0) }
	}

	/// Events handled so far
	pub fn processed(&self) -> u64 {
		self.processed.load(Ordering::Relaxed)
	}
}

#[async_trait]
impl Handler for AwsEventHandler {
	async fn process(&self, ctx: &TaskContext, task: &TaskEnvelope) -> Result<(), HandlerError> {
		self.limiter.acquire_or_retry()?;

		let event: AwsEventPayload = task.decode().map_err(HandlerError::skip_retry)?;
		info!("Processing {} event for {} (retried {})", event.action, event.id, ctx.retried);
		self.processed.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}
}

/// Register the fan-out handlers and the rate-limited downstream handler
pub fn register_event_handlers(
	builder: HandlerRegistryBuilder,
	client: &Client,
	aws: Arc<AwsEventHandler>,
) -> HandlerRegistryBuilder {
	builder
		.handle(TYPE_EVENT_START, FanOutHandler::new(client.clone(), EventAction::Start))
		.handle(TYPE_EVENT_STOP, FanOutHandler::new(client.clone(), EventAction::Stop))
		.handle_arc(TYPE_EVENT_AWS, aws)
}


// vim: ts=4
