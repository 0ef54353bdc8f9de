//! Handler contract and the type → handler registry.
//!
//! The registry is assembled once through `HandlerRegistry::builder()` and is
//! immutable afterwards; the dispatcher only ever reads it.

use async_trait::async_trait;
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

/// Outcome of a failed handler attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
	/// Unrecoverable (e.g. malformed payload); the task is archived at once
	SkipRetry(String),
	/// Throttled; retried after `retry_in` without consuming the retry budget
	RateLimited { retry_in: Duration },
	/// Attempt deadline passed before the handler finished
	Cancelled,
	Failed(String),
}

impl HandlerError {
	pub fn skip_retry(err: impl fmt::Display) -> Self {
		HandlerError::SkipRetry(err.to_string())
	}

	pub fn failed(err: impl fmt::Display) -> Self {
		HandlerError::Failed(err.to_string())
	}

	pub fn is_skip_retry(&self) -> bool {
		matches!(self, HandlerError::SkipRetry(_))
	}

	pub fn is_rate_limited(&self) -> bool {
		matches!(self, HandlerError::RateLimited { .. })
	}

	/// Delay recommended by the error itself, if any
	pub fn retry_in(&self) -> Option<Duration> {
		match self {
			HandlerError::RateLimited { retry_in } => Some(*retry_in),
			_ => None,
		}
	}
}

impl fmt::Display for HandlerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HandlerError::SkipRetry(msg) => write!(f, "{}: skip retry", msg),
			HandlerError::RateLimited { retry_in } => {
				write!(f, "rate limited (retry in {:?})", retry_in)
			}
			HandlerError::Cancelled => write!(f, "context cancelled"),
			HandlerError::Failed(msg) => f.write_str(msg),
		}
	}
}

impl std::error::Error for HandlerError {}

impl From<Error> for HandlerError {
	fn from(err: Error) -> Self {
		HandlerError::Failed(err.to_string())
	}
}

/// Per-attempt context handed to a handler
#[derive(Clone, Debug)]
pub struct TaskContext {
	pub id: Box<str>,
	pub queue: Box<str>,
	/// Budget-consuming failures before this attempt
	pub retried: u32,
	pub max_retries: u32,
	pub deadline: Option<Timestamp>,
	cancel: CancellationToken,
}

impl TaskContext {
	pub fn new(
		id: impl Into<Box<str>>,
		queue: impl Into<Box<str>>,
		retried: u32,
		max_retries: u32,
		deadline: Option<Timestamp>,
	) -> Self {
		Self {
			id: id.into(),
			queue: queue.into(),
			retried,
			max_retries,
			deadline,
			cancel: CancellationToken::new(),
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves once the attempt is cancelled
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}

	pub(crate) fn cancel(&self) {
		self.cancel.cancel();
	}
}

#[async_trait]
pub trait Handler: Send + Sync {
	async fn process(&self, ctx: &TaskContext, task: &TaskEnvelope) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a `Handler`
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
	F: Fn(TaskContext, TaskEnvelope) -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), HandlerError>> + Send,
{
	async fn process(&self, ctx: &TaskContext, task: &TaskEnvelope) -> Result<(), HandlerError> {
		(self.0)(ctx.clone(), task.clone()).await
	}
}

type HandlerMap = HashMap<Box<str>, Arc<dyn Handler>>;

#[derive(Clone)]
pub struct HandlerRegistry {
	handlers: Arc<HandlerMap>,
}

impl HandlerRegistry {
	pub fn builder() -> HandlerRegistryBuilder {
		HandlerRegistryBuilder { handlers: HashMap::new() }
	}

	pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
		self.handlers.get(kind).cloned()
	}

	pub fn kinds(&self) -> Vec<&str> {
		let mut kinds: Vec<&str> = self.handlers.keys().map(AsRef::as_ref).collect();
		kinds.sort_unstable();
		kinds
	}
}

impl fmt::Debug for HandlerRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HandlerRegistry").field("kinds", &self.kinds()).finish()
	}
}

pub struct HandlerRegistryBuilder {
	handlers: HandlerMap,
}

impl HandlerRegistryBuilder {
	pub fn handle(self, kind: impl Into<Box<str>>, handler: impl Handler + 'static) -> Self {
		self.handle_arc(kind, Arc::new(handler))
	}

	pub fn handle_arc(mut self, kind: impl Into<Box<str>>, handler: Arc<dyn Handler>) -> Self {
		let kind = kind.into();
		info!("Registering task type {}", kind);
		if self.handlers.insert(kind.clone(), handler).is_some() {
			warn!("Handler for task type {} replaced", kind);
		}
		self
	}

	pub fn build(self) -> HandlerRegistry {
		HandlerRegistry { handlers: Arc::new(self.handlers) }
	}
}


// vim: ts=4
