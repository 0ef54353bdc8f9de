//! Shared token-bucket rate limiter.
//!
//! Wraps a governor GCRA limiter (equivalent to a token bucket with the same
//! rate and burst). The refill-and-debit step is a single atomic operation
//! inside governor; callers only see `try_acquire`.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use rand::RngExt;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::handler::HandlerError;
use crate::prelude::*;

pub struct RateLimiter {
	limiter: DefaultDirectRateLimiter,
	clock: DefaultClock,
	rate: f64,
	burst: NonZeroU32,
	/// Random extra delay added to the suggested retry to spread out retries
	retry_jitter: Duration,
}

impl RateLimiter {
	/// `rate` permits per second, at most `burst` available at once
	pub fn new(rate: f64, burst: u32) -> CdResult<Self> {
		if !rate.is_finite() || rate <= 0.0 {
			return Err(Error::ValidationError(format!("invalid rate limit: {}", rate)));
		}
		let burst = NonZeroU32::new(burst)
			.ok_or_else(|| Error::ValidationError("rate limit burst must be positive".into()))?;
		let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
			.ok_or_else(|| Error::ValidationError(format!("invalid rate limit: {}", rate)))?
			.allow_burst(burst);

		Ok(Self {
			limiter: governor::RateLimiter::direct(quota),
			clock: DefaultClock::default(),
			rate,
			burst,
			retry_jitter: Duration::ZERO,
		})
	}

	#[must_use]
	pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
		self.retry_jitter = jitter;
		self
	}

	pub fn rate(&self) -> f64 {
		self.rate
	}

	pub fn burst(&self) -> u32 {
		self.burst.get()
	}

	/// Take one permit, or report how long until one is available
	pub fn try_acquire(&self) -> Result<(), Duration> {
		self.limiter.check().map_err(|not_until| not_until.wait_time_from(self.clock.now()))
	}

	/// Take one permit, converting exhaustion into a retryable `RateLimited` error
	pub fn acquire_or_retry(&self) -> Result<(), HandlerError> {
		self.try_acquire().map_err(|wait| {
			let jitter_ms = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
			let jitter = if jitter_ms == 0 { 0 } else { rand::rng().random_range(0..=jitter_ms) };
			HandlerError::RateLimited { retry_in: wait + Duration::from_millis(jitter) }
		})
	}
}

impl fmt::Debug for RateLimiter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RateLimiter")
			.field("rate", &self.rate)
			.field("burst", &self.burst)
			.field("retry_jitter", &self.retry_jitter)
			.finish_non_exhaustive()
	}
}


// vim: ts=4
