//! Cadence service: runs the dispatcher and the periodic task manager until
//! interrupted.

mod config;

use std::sync::Arc;

use cadence_core::client::Client;
use cadence_core::dispatcher::{Dispatcher, DispatcherConfig};
use cadence_core::events::{
	AwsEventHandler, TYPE_EVENT_START, TYPE_EVENT_STOP, build_event_start, build_event_stop,
	register_event_handlers,
};
use cadence_core::handler::HandlerRegistry;
use cadence_core::kv::{KvConfigProvider, MemoryKv};
use cadence_core::periodic::{PeriodicTaskManager, PeriodicTaskManagerOpts};
use cadence_core::rate_limit::RateLimiter;
use cadence_core::store::MemoryQueueStore;
use cadence_types::error::CdResult;
use tracing::{error, info};

use crate::config::Config;

fn init_tracing() {
	let filter = std::env::var("LOG_LEVEL")
		.ok()
		.and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
		.or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
		.unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(config: Config) -> CdResult<()> {
	let store = MemoryQueueStore::new();
	let client = Client::new(store.clone());

	let kv = MemoryKv::new();
	for (key, spec) in &config.schedules {
		kv.set(key.as_str(), spec.as_str());
	}

	let limiter =
		Arc::new(RateLimiter::new(config.aws_rate, config.aws_burst)?.with_retry_jitter(config.aws_retry_jitter));
	let aws = Arc::new(AwsEventHandler::new(limiter));
	let registry = register_event_handlers(HandlerRegistry::builder(), &client, aws).build();

	let dispatcher = Dispatcher::new(
		store,
		registry,
		DispatcherConfig {
			concurrency: config.concurrency,
			queues: config.queues.clone(),
			..Default::default()
		},
	)?;

	let manager = PeriodicTaskManager::builder(Arc::new(KvConfigProvider::new(kv)), client)
		.opts(PeriodicTaskManagerOpts {
			sync_interval: config.sync_interval,
			timezone: config.timezone,
			..Default::default()
		})
		.task(TYPE_EVENT_START, build_event_start)
		.task(TYPE_EVENT_STOP, build_event_stop)
		.build();

	dispatcher.start()?;
	let sync = manager.start();

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Cannot listen for shutdown signal: {}", e);
	}
	info!("Shutting down");

	manager.shutdown().await?;
	if let Err(e) = sync.await {
		error!("Periodic task manager failed: {}", e);
	}
	dispatcher.shutdown().await
}

#[tokio::main]
async fn main() {
	init_tracing();

	let config = match Config::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			std::process::exit(2);
		}
	};
	info!("Cadence v{} starting", env!("CARGO_PKG_VERSION"));

	if let Err(e) = run(config).await {
		error!("Fatal: {}", e);
		std::process::exit(1);
	}
}

// vim: ts=4
