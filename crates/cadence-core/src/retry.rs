//! Retry and failure-classification policy.
//!
//! Two independent questions are answered for every failed attempt: does it
//! count against the task's retry budget, and how long to wait before the
//! next attempt. `SkipRetry` errors bypass both and archive the task.

use rand::RngExt;
use std::{fmt, sync::Arc, time::Duration};

use crate::handler::HandlerError;
use crate::prelude::*;

pub type IsFailureFn = dyn Fn(&HandlerError) -> bool + Send + Sync;
pub type RetryDelayFn = dyn Fn(u32, &HandlerError, &TaskEnvelope) -> Duration + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveReason {
	SkipRetry,
	RetriesExhausted,
	NoHandler,
}

impl fmt::Display for ArchiveReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ArchiveReason::SkipRetry => f.write_str("skip retry"),
			ArchiveReason::RetriesExhausted => f.write_str("retries exhausted"),
			ArchiveReason::NoHandler => f.write_str("no handler"),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
	Retry {
		delay: Duration,
		/// Whether this attempt is charged against the retry budget
		is_failure: bool,
	},
	Archive(ArchiveReason),
}

#[derive(Clone)]
pub struct RetryPolicy {
	wait_min_max: (Duration, Duration),
	is_failure: Arc<IsFailureFn>,
	retry_delay: Option<Arc<RetryDelayFn>>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new((Duration::from_secs(15), Duration::from_secs(3600)))
	}
}

impl fmt::Debug for RetryPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RetryPolicy")
			.field("wait_min_max", &self.wait_min_max)
			.field("custom_delay", &self.retry_delay.is_some())
			.finish_non_exhaustive()
	}
}

impl RetryPolicy {
	/// Policy with custom min/max backoff. Rate-limit errors do not count as failures.
	pub fn new(wait_min_max: (Duration, Duration)) -> Self {
		Self {
			wait_min_max,
			is_failure: Arc::new(|err: &HandlerError| !err.is_rate_limited()),
			retry_delay: None,
		}
	}

	/// Replace the predicate deciding whether an error consumes retry budget
	pub fn is_failure(
		mut self,
		predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static,
	) -> Self {
		self.is_failure = Arc::new(predicate);
		self
	}

	/// Replace the backoff formula. Error-supplied delays still take precedence.
	pub fn retry_delay(
		mut self,
		delay: impl Fn(u32, &HandlerError, &TaskEnvelope) -> Duration + Send + Sync + 'static,
	) -> Self {
		self.retry_delay = Some(Arc::new(delay));
		self
	}

	/// Exponential backoff: min * 2^attempt, capped at max
	pub fn calculate_backoff(&self, attempt_count: u32) -> Duration {
		let (min, max) = self.wait_min_max;
		let factor = 1u32.checked_shl(attempt_count.min(31)).unwrap_or(u32::MAX);
		min.checked_mul(factor).unwrap_or(max).min(max)
	}

	/// Backoff plus up to 25% random jitter, never above max
	pub fn backoff_with_jitter(&self, attempt_count: u32) -> Duration {
		let base = self.calculate_backoff(attempt_count);
		let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
		let jitter = if spread == 0 { 0 } else { rand::rng().random_range(0..=spread) };
		(base + Duration::from_millis(jitter)).min(self.wait_min_max.1.max(base))
	}

	pub fn counts_as_failure(&self, err: &HandlerError) -> bool {
		(self.is_failure)(err)
	}

	/// Delay before the next attempt; an error-supplied `retry_in` wins
	pub fn delay_for(&self, retried: u32, err: &HandlerError, task: &TaskEnvelope) -> Duration {
		if let Some(retry_in) = err.retry_in() {
			return retry_in;
		}
		match &self.retry_delay {
			Some(delay) => delay(retried, err, task),
			None => self.backoff_with_jitter(retried),
		}
	}

	/// Decide what happens after a failed attempt.
	///
	/// `retried` is the number of budget-consuming failures before this one.
	/// Attempts that do not count as failures are retried regardless of budget.
	pub fn decide(&self, err: &HandlerError, retried: u32, task: &TaskEnvelope) -> RetryDecision {
		if err.is_skip_retry() {
			return RetryDecision::Archive(ArchiveReason::SkipRetry);
		}
		let is_failure = self.counts_as_failure(err);
		if is_failure && retried >= task.options().max_retries {
			return RetryDecision::Archive(ArchiveReason::RetriesExhausted);
		}
		RetryDecision::Retry { delay: self.delay_for(retried, err, task), is_failure }
	}
}


// vim: ts=4
