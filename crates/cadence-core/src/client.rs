//! Producer API. Enqueuing never waits for processing.

use std::{sync::Arc, time::Duration};

use crate::prelude::*;
use crate::store::QueueStore;

#[derive(Clone)]
pub struct Client {
	store: Arc<dyn QueueStore>,
}

impl Client {
	pub fn new(store: Arc<dyn QueueStore>) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &Arc<dyn QueueStore> {
		&self.store
	}

	/// Enqueue with the envelope's own options
	pub async fn enqueue(&self, task: TaskEnvelope) -> CdResult<TaskInfo> {
		task.validate()?;
		match self.store.enqueue(task).await {
			Ok(info) => {
				debug!(
					id = %info.id, queue = %info.queue, state = %info.state, task_type = %info.kind,
					"enqueued task"
				);
				Ok(info)
			}
			Err(Error::DuplicateTask(key)) => {
				debug!(unique_key = %key, "task with this unique key already enqueued");
				Err(Error::DuplicateTask(key))
			}
			Err(e) => {
				warn!("enqueue failed: {}", e);
				Err(e)
			}
		}
	}

	/// Enqueue with `opts` replacing the envelope's options
	pub async fn enqueue_with(&self, task: TaskEnvelope, opts: TaskOptions) -> CdResult<TaskInfo> {
		self.enqueue(task.with_options(opts)).await
	}

	/// Start a fluent enqueue, seeded with the envelope's options
	pub fn task(&self, task: TaskEnvelope) -> EnqueueBuilder<'_> {
		EnqueueBuilder::new(self, task)
	}
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish_non_exhaustive()
	}
}

// EnqueueBuilder - Fluent API for enqueuing
//*******************************************
pub struct EnqueueBuilder<'a> {
	client: &'a Client,
	opts: TaskOptions,
	task: TaskEnvelope,
}

impl<'a> EnqueueBuilder<'a> {
	fn new(client: &'a Client, task: TaskEnvelope) -> Self {
		Self { client, opts: task.options().clone(), task }
	}

	pub fn queue(mut self, queue: impl Into<Box<str>>) -> Self {
		self.opts.queue = queue.into();
		self
	}

	pub fn max_retries(mut self, max_retries: u32) -> Self {
		self.opts.max_retries = max_retries;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.opts.timeout = Some(timeout);
		self
	}

	pub fn deadline(mut self, deadline: Timestamp) -> Self {
		self.opts.deadline = Some(deadline);
		self
	}

	/// Process at a specific timestamp
	pub fn process_at(mut self, at: Timestamp) -> Self {
		self.opts.process_at = Some(at);
		self
	}

	/// Process after a relative delay
	pub fn process_in(mut self, delay: Duration) -> Self {
		self.opts.process_at = Some(Timestamp::from_now(delay));
		self
	}

	pub fn retention(mut self, retention: Duration) -> Self {
		self.opts.retention = Some(retention);
		self
	}

	/// Reject the enqueue if a live task already holds `key`
	pub fn unique(mut self, key: impl Into<Box<str>>) -> Self {
		self.opts.unique_key = Some(key.into());
		self
	}

	pub async fn enqueue(self) -> CdResult<TaskInfo> {
		self.client.enqueue_with(self.task, self.opts).await
	}
}


// vim: ts=4
