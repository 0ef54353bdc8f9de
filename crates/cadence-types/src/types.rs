use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Timestamp //
//***********//
/// Wall-clock instant in milliseconds since the Unix epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Self {
		let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
		Timestamp(i64::try_from(res.as_millis()).unwrap_or(i64::MAX))
	}

	pub fn from_now(delay: Duration) -> Self {
		Self::now().add_duration(delay)
	}

	#[must_use]
	pub fn add_duration(self, delay: Duration) -> Self {
		let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
		Timestamp(self.0.saturating_add(ms))
	}

	/// Time left until this instant, zero if it already passed
	pub fn until(self) -> Duration {
		let diff = self.0 - Self::now().0;
		Duration::from_millis(u64::try_from(diff).unwrap_or_default())
	}

	pub fn from_datetime<Tz: chrono::TimeZone>(dt: &DateTime<Tz>) -> Self {
		Timestamp(dt.timestamp_millis())
	}

	pub fn to_datetime(self) -> DateTime<Utc> {
		DateTime::<Utc>::from_timestamp_millis(self.0).unwrap_or_default()
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}


// vim: ts=4
