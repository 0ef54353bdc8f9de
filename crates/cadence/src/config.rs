//! Startup configuration read from the environment

use chrono_tz::Tz;
use std::time::Duration;

use cadence_core::cron::parse_duration;
use cadence_core::periodic::{DEFAULT_SYNC_INTERVAL, DEFAULT_TIMEZONE, load_timezone};
use cadence_types::error::{CdResult, Error};

pub const DEFAULT_AWS_RETRY_JITTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Config {
	pub concurrency: usize,
	pub queues: Vec<(Box<str>, u32)>,
	pub timezone: Tz,
	pub sync_interval: Duration,
	/// Permits per second for `event:aws` processing
	pub aws_rate: f64,
	pub aws_burst: u32,
	/// Upper bound of the random delay added to rate-limited retries
	pub aws_retry_jitter: Duration,
	/// Initial `schedule:<task_type>:<id>` → cron spec entries
	pub schedules: Vec<(String, String)>,
}

impl Config {
	pub fn from_env() -> CdResult<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> CdResult<Self> {
		let concurrency = match get("CADENCE_CONCURRENCY") {
			Some(v) => parse_number::<usize>("CADENCE_CONCURRENCY", &v)?,
			None => 10,
		};
		if concurrency == 0 {
			return Err(Error::ConfigError("CADENCE_CONCURRENCY must be at least 1".into()));
		}

		let queues = parse_queues(get("CADENCE_QUEUES").as_deref().unwrap_or("aws=5,cron=5"))?;
		let timezone = load_timezone(get("CADENCE_TIMEZONE").as_deref().unwrap_or(DEFAULT_TIMEZONE))?;

		let sync_interval = match get("CADENCE_SYNC_INTERVAL") {
			Some(v) => parse_interval("CADENCE_SYNC_INTERVAL", &v)?,
			None => DEFAULT_SYNC_INTERVAL,
		};
		if sync_interval.is_zero() {
			return Err(Error::ConfigError("CADENCE_SYNC_INTERVAL must be positive".into()));
		}

		let aws_rate = match get("CADENCE_AWS_RATE") {
			Some(v) => parse_number::<f64>("CADENCE_AWS_RATE", &v)?,
			None => 1.0,
		};
		let aws_burst = match get("CADENCE_AWS_BURST") {
			Some(v) => parse_number::<u32>("CADENCE_AWS_BURST", &v)?,
			None => 1,
		};
		let aws_retry_jitter = match get("CADENCE_AWS_RETRY_JITTER") {
			Some(v) => parse_interval("CADENCE_AWS_RETRY_JITTER", &v)?,
			None => DEFAULT_AWS_RETRY_JITTER,
		};

		let schedules = get("CADENCE_SCHEDULES").as_deref().map(parse_schedules).transpose()?.unwrap_or_default();

		Ok(Self { concurrency, queues, timezone, sync_interval, aws_rate, aws_burst, aws_retry_jitter, schedules })
	}
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> CdResult<T>
where
	T::Err: std::fmt::Display,
{
	value.trim().parse().map_err(|e| Error::ConfigError(format!("{}: {}", name, e)))
}

/// Plain numbers are seconds
fn parse_interval(name: &str, value: &str) -> CdResult<Duration> {
	let value = value.trim();
	if value.chars().all(|c| c.is_ascii_digit()) {
		return Ok(Duration::from_secs(parse_number::<u64>(name, value)?));
	}
	parse_duration(value).map_err(|e| Error::ConfigError(format!("{}: {}", name, e)))
}

/// `name=weight,name=weight`
fn parse_queues(value: &str) -> CdResult<Vec<(Box<str>, u32)>> {
	let mut queues = Vec::new();
	for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
		let (name, weight) = item
			.split_once('=')
			.ok_or_else(|| Error::ConfigError(format!("CADENCE_QUEUES: expected name=weight, got '{}'", item)))?;
		let weight = parse_number::<u32>("CADENCE_QUEUES", weight)?;
		if name.trim().is_empty() || weight == 0 {
			return Err(Error::ConfigError(format!("CADENCE_QUEUES: invalid entry '{}'", item)));
		}
		queues.push((name.trim().into(), weight));
	}
	if queues.is_empty() {
		return Err(Error::ConfigError("CADENCE_QUEUES is empty".into()));
	}
	Ok(queues)
}

/// `key=spec;key=spec`
fn parse_schedules(value: &str) -> CdResult<Vec<(String, String)>> {
	value
		.split(';')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|item| {
			item.split_once('=')
				.map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
				.ok_or_else(|| Error::ConfigError(format!("CADENCE_SCHEDULES: expected key=spec, got '{}'", item)))
		})
		.collect()
}


// vim: ts=4
