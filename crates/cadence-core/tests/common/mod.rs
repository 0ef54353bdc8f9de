//! Shared helpers for the dispatcher integration tests

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use cadence_core::dispatcher::{Dispatcher, DispatcherConfig, TaskOutcome};
use cadence_core::handler::HandlerRegistry;
use cadence_core::retry::RetryPolicy;
use cadence_core::store::MemoryQueueStore;
use cadence_types::task::TaskState;

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Short intervals so retries happen within the test
pub fn fast_config(queues: &[(&str, u32)]) -> DispatcherConfig {
	DispatcherConfig {
		concurrency: 4,
		queues: queues.iter().map(|(q, w)| ((*q).into(), *w)).collect(),
		retry: RetryPolicy::new((Duration::from_millis(10), Duration::from_millis(40))),
		poll_interval: Duration::from_millis(10),
		lease: Duration::from_millis(500),
		purge_interval: Duration::from_millis(200),
		shutdown_timeout: Duration::from_millis(200),
	}
}

pub fn dispatcher(
	store: &Arc<MemoryQueueStore>,
	registry: HandlerRegistry,
	config: DispatcherConfig,
) -> Arc<Dispatcher> {
	Dispatcher::new(store.clone(), registry, config).unwrap()
}

/// Collect outcomes until `done` returns true for one of them or the timeout passes
pub async fn collect_until(
	rx: &flume::Receiver<TaskOutcome>,
	timeout: Duration,
	mut done: impl FnMut(&TaskOutcome) -> bool,
) -> Vec<TaskOutcome> {
	let mut seen = Vec::new();
	let _ = tokio::time::timeout(timeout, async {
		while let Ok(outcome) = rx.recv_async().await {
			let finished = done(&outcome);
			seen.push(outcome);
			if finished {
				break;
			}
		}
	})
	.await;
	seen
}

pub fn is_terminal(outcome: &TaskOutcome) -> bool {
	matches!(outcome.state, TaskState::Completed | TaskState::Archived)
}

// vim: ts=4
