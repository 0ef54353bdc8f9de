//! Schedule configs stored as `schedule:<task_type>:<id>` keys whose value is
//! the cron spec.

use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

use crate::periodic::{ConfigProvider, ScheduleConfig};
use crate::prelude::*;

pub const SCHEDULE_PREFIX: &str = "schedule";

#[async_trait]
pub trait KvSource: Send + Sync {
	/// All key/value pairs whose key starts with `prefix`
	async fn scan_prefix(&self, prefix: &str) -> CdResult<Vec<(String, String)>>;
}

/// In-memory key/value source
#[derive(Debug, Default)]
pub struct MemoryKv {
	data: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
		self.data.write().insert(key.into(), value.into());
	}

	pub fn remove(&self, key: &str) -> Option<String> {
		self.data.write().remove(key)
	}
}

#[async_trait]
impl KvSource for MemoryKv {
	async fn scan_prefix(&self, prefix: &str) -> CdResult<Vec<(String, String)>> {
		let data = self.data.read();
		Ok(data
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect())
	}
}

/// Split a schedule key into task type and id. The task type may itself contain `:`.
pub fn parse_schedule_key(key: &str) -> CdResult<(&str, &str)> {
	let malformed = || Error::Parse(format!("malformed schedule key '{}'", key));
	let rest = key
		.strip_prefix(SCHEDULE_PREFIX)
		.and_then(|rest| rest.strip_prefix(':'))
		.ok_or_else(malformed)?;
	let (task_type, id) = rest.rsplit_once(':').ok_or_else(malformed)?;
	if task_type.is_empty() || id.is_empty() {
		return Err(malformed());
	}
	Ok((task_type, id))
}

/// Builds schedule configs from a key/value listing, one per (task type, cron spec)
pub struct KvConfigProvider {
	source: Arc<dyn KvSource>,
}

impl KvConfigProvider {
	pub fn new(source: Arc<dyn KvSource>) -> Self {
		Self { source }
	}
}

#[async_trait]
impl ConfigProvider for KvConfigProvider {
	async fn get_configs(&self) -> CdResult<Vec<ScheduleConfig>> {
		let pairs = self.source.scan_prefix(&format!("{}:", SCHEDULE_PREFIX)).await?;

		let mut parsed = Vec::with_capacity(pairs.len());
		for (key, value) in &pairs {
			let (task_type, id) = parse_schedule_key(key)?;
			let spec = value.trim();
			if spec.is_empty() {
				return Err(Error::Parse(format!("empty cron spec for '{}'", key)));
			}
			parsed.push(((task_type, spec), id));
		}

		let configs = parsed
			.into_iter()
			.into_group_map()
			.into_iter()
			.sorted()
			.map(|((task_type, cron_spec), ids)| ScheduleConfig {
				task_type: task_type.into(),
				cron_spec: cron_spec.into(),
				ids: ids.into_iter().map(ToString::to_string).collect(),
			})
			.collect::<Vec<_>>();
		debug!("Loaded {} schedule configs from {} keys", configs.len(), pairs.len());
		Ok(configs)
	}
}

impl std::fmt::Debug for KvConfigProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KvConfigProvider").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_schedule_key() -> CdResult<()> {
		assert_eq!(parse_schedule_key("schedule:event:start:42")?, ("event:start", "42"));
		assert_eq!(parse_schedule_key("schedule:report:7")?, ("report", "7"));
		for bad in ["schedule:report", "schedule::7", "schedule:report:", "other:report:7", "schedulex:a:b"] {
			assert!(matches!(parse_schedule_key(bad), Err(Error::Parse(_))), "{}", bad);
		}
		Ok(())
	}

	#[tokio::test]
	async fn test_scan_prefix() -> CdResult<()> {
		let kv = MemoryKv::new();
		kv.set("schedule:a:1", "x");
		kv.set("schedule:b:2", "y");
		kv.set("scheduled", "z");
		kv.set("zzz", "w");
		let keys: Vec<String> = kv.scan_prefix("schedule:").await?.into_iter().map(|(k, _)| k).collect();
		assert_eq!(keys, vec!["schedule:a:1", "schedule:b:2"]);
		Ok(())
	}

	#[tokio::test]
	async fn test_configs_merge_ids() -> CdResult<()> {
		let kv = MemoryKv::new();
		kv.set("schedule:event:start:1", "0 8 * * *");
		kv.set("schedule:event:start:2", "0 8 * * *");
		kv.set("schedule:event:start:3", "0 9 * * *");
		kv.set("schedule:event:stop:1", " 0 18 * * * ");
		kv.set("unrelated", "ignored");

		let configs = KvConfigProvider::new(kv).get_configs().await?;
		assert_eq!(
			configs,
			vec![
				ScheduleConfig { task_type: "event:start".into(), cron_spec: "0 8 * * *".into(), ids: vec!["1".into(), "2".into()] },
				ScheduleConfig { task_type: "event:start".into(), cron_spec: "0 9 * * *".into(), ids: vec!["3".into()] },
				ScheduleConfig { task_type: "event:stop".into(), cron_spec: "0 18 * * *".into(), ids: vec!["1".into()] },
			]
		);
		Ok(())
	}

	#[tokio::test]
	async fn test_malformed_key_fails_listing() {
		let kv = MemoryKv::new();
		kv.set("schedule:event:start:1", "0 8 * * *");
		kv.set("schedule:orphan", "0 8 * * *");
		let res = KvConfigProvider::new(kv).get_configs().await;
		assert!(matches!(res, Err(Error::Parse(_))));
	}
}

// vim: ts=4
