//! Periodic sync, fan-out and rate limiting wired together

mod common;

use std::{sync::Arc, time::Duration};

use cadence_core::client::Client;
use cadence_core::events::{
	AWS_QUEUE, AwsEventHandler, TYPE_EVENT_AWS, TYPE_EVENT_START, TYPE_EVENT_STOP, build_event_start,
	build_event_stop, register_event_handlers,
};
use cadence_core::handler::HandlerRegistry;
use cadence_core::kv::{KvConfigProvider, MemoryKv};
use cadence_core::periodic::{PeriodicTaskManager, PeriodicTaskManagerOpts};
use cadence_core::rate_limit::RateLimiter;
use cadence_core::store::{MemoryQueueStore, QueueStore};
use cadence_types::task::TaskState;

use common::*;

#[tokio::test]
async fn test_start_batch_fans_out_and_completes() {
	init_tracing();
	let store = MemoryQueueStore::new();
	let client = Client::new(store.clone());
	let aws = Arc::new(AwsEventHandler::new(Arc::new(RateLimiter::new(100.0, 10).unwrap())));
	let registry = register_event_handlers(HandlerRegistry::builder(), &client, aws.clone()).build();
	let dispatcher = dispatcher(&store, registry, fast_config(&[("cron", 5), (AWS_QUEUE, 5)]));
	let rx = dispatcher.outcomes();

	let ids: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
	let batch = build_event_start(&ids).unwrap();
	client.task(batch).queue("cron").enqueue().await.unwrap();
	dispatcher.start().unwrap();

	let mut completed = 0;
	let outcomes = collect_until(&rx, Duration::from_secs(3), |o| {
		if o.state == TaskState::Completed {
			completed += 1;
		}
		completed == 4
	})
	.await;
	dispatcher.shutdown().await.unwrap();

	let aws_done: Vec<_> = outcomes
		.iter()
		.filter(|o| &*o.task_type == TYPE_EVENT_AWS && o.state == TaskState::Completed)
		.collect();
	assert_eq!(aws_done.len(), 3);
	assert!(aws_done.iter().all(|o| &*o.queue == AWS_QUEUE));
	assert_eq!(aws.processed(), 3);
}

#[tokio::test]
async fn test_throttled_downstream_retries_without_budget() {
	init_tracing();
	let store = MemoryQueueStore::new();
	let client = Client::new(store.clone());
	let aws = Arc::new(AwsEventHandler::new(Arc::new(RateLimiter::new(5.0, 1).unwrap())));
	let registry = register_event_handlers(HandlerRegistry::builder(), &client, aws.clone()).build();
	let dispatcher = dispatcher(&store, registry, fast_config(&[("cron", 1), (AWS_QUEUE, 1)]));
	let rx = dispatcher.outcomes();

	let ids: Vec<String> = (0..4).map(|i| format!("id{}", i)).collect();
	for id in &ids {
		// zero retry budget: only throttling retries are possible
		client
			.task(cadence_core::events::build_aws_event(id, cadence_core::events::EventAction::Stop).unwrap())
			.max_retries(0)
			.enqueue()
			.await
			.unwrap();
	}
	dispatcher.start().unwrap();

	let mut completed = 0;
	let outcomes = collect_until(&rx, Duration::from_secs(5), |o| {
		if o.state == TaskState::Completed {
			completed += 1;
		}
		completed == ids.len()
	})
	.await;
	dispatcher.shutdown().await.unwrap();

	assert!(outcomes.iter().any(|o| o.state == TaskState::Retry));
	assert!(outcomes.iter().all(|o| o.state != TaskState::Archived));
	assert!(
		outcomes
			.iter()
			.filter(|o| o.state == TaskState::Retry)
			.all(|o| o.error.as_deref().is_some_and(|e| e.starts_with("rate limited")))
	);
	assert_eq!(aws.processed(), 4);
}

#[tokio::test]
async fn test_kv_schedules_drive_fan_out() {
	init_tracing();
	let store = MemoryQueueStore::new();
	let client = Client::new(store.clone());
	let kv = MemoryKv::new();
	kv.set("schedule:event:start:a", "@every 1s");
	kv.set("schedule:event:start:b", "@every 1s");
	kv.set("schedule:event:stop:a", "@every 1h");
	kv.set("schedule:event:unknown:z", "@every 1s");

	let manager = PeriodicTaskManager::builder(Arc::new(KvConfigProvider::new(kv.clone())), client.clone())
		.opts(PeriodicTaskManagerOpts {
			sync_interval: Duration::from_millis(200),
			timezone: chrono_tz::UTC,
			..Default::default()
		})
		.task(TYPE_EVENT_START, build_event_start)
		.task(TYPE_EVENT_STOP, build_event_stop)
		.build();

	let report = manager.sync().await.unwrap();
	assert_eq!((report.added, report.skipped), (2, 1));

	let aws = Arc::new(AwsEventHandler::new(Arc::new(RateLimiter::new(50.0, 10).unwrap())));
	let registry = register_event_handlers(HandlerRegistry::builder(), &client, aws.clone()).build();
	let dispatcher = dispatcher(&store, registry, fast_config(&[("cron", 5), (AWS_QUEUE, 5)]));
	dispatcher.start().unwrap();
	let handle = manager.start();

	tokio::time::sleep(Duration::from_millis(1500)).await;
	assert!(aws.processed() >= 2, "processed {}", aws.processed());

	// dropping the start schedule leaves only the hourly stop entry
	kv.remove("schedule:event:start:a");
	kv.remove("schedule:event:start:b");
	tokio::time::sleep(Duration::from_millis(500)).await;
	let entries = manager.entries().await.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(&*entries[0].task_type, TYPE_EVENT_STOP);

	manager.shutdown().await.unwrap();
	handle.await.unwrap();
	dispatcher.shutdown().await.unwrap();
	assert!(store.list("cron").await.unwrap().iter().all(|t| t.state != TaskState::Archived));
}

// vim: ts=4
