//! Job-processing core for Cadence.
//!
//! A multi-queue task dispatcher with at-least-once delivery, a retry policy
//! that can be overridden per error kind, a cron scheduler kept in sync with
//! an external schedule source, and a shared token-bucket rate limiter for
//! fan-out handlers.
//!
//! Data flows config provider → periodic manager → cron scheduler → client →
//! queue store → dispatcher → handler registry, and optionally back into the
//! client when a handler fans out follow-up tasks.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod client;
pub mod cron;
pub mod dispatcher;
pub mod events;
pub mod handler;
pub mod kv;
pub mod periodic;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod store;

pub use client::Client;
pub use cron::{CronEntryInfo, CronScheduler, Schedule};
pub use dispatcher::{Dispatcher, DispatcherConfig, QueueSelector, TaskOutcome};
pub use handler::{Handler, HandlerError, HandlerFn, HandlerRegistry, TaskContext};
pub use kv::{KvConfigProvider, KvSource, MemoryKv};
pub use periodic::{
	ConfigProvider, PeriodicTaskManager, PeriodicTaskManagerOpts, ScheduleConfig, SyncReport,
};
pub use rate_limit::RateLimiter;
pub use retry::{ArchiveReason, RetryDecision, RetryPolicy};
pub use store::{MemoryQueueStore, QueueStore};

// vim: ts=4
