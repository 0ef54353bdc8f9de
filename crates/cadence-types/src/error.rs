//! Error type shared by every Cadence crate.

use std::fmt;

pub type CdResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// Bad producer input (empty type, unserializable payload, bad option)
	ValidationError(String),
	/// The durable store cannot accept the operation right now
	StoreUnavailable(String),
	/// A non-expired task already holds this unique key
	DuplicateTask(Box<str>),
	/// No handler is registered for this task type
	NoHandler(Box<str>),
	NotFound,
	ConfigError(String),
	Parse(String),
	Timeout,
	Internal(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
			Error::StoreUnavailable(msg) => write!(f, "store unavailable: {}", msg),
			Error::DuplicateTask(key) => write!(f, "duplicate task: unique key '{}' is taken", key),
			Error::NoHandler(kind) => write!(f, "no handler registered for task type '{}'", kind),
			Error::NotFound => write!(f, "not found"),
			Error::ConfigError(msg) => write!(f, "config error: {}", msg),
			Error::Parse(msg) => write!(f, "parse error: {}", msg),
			Error::Timeout => write!(f, "timeout"),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::ValidationError(format!("payload serialization failed: {}", err))
	}
}

impl From<std::num::ParseIntError> for Error {
	fn from(err: std::num::ParseIntError) -> Self {
		Error::Parse(err.to_string())
	}
}

/// Lock a `std::sync::Mutex`, mapping a poisoned lock to `Error::Internal`.
///
/// `lock!(self.items)?` or `lock!(self.items, "items")?`
#[macro_export]
macro_rules! lock {
	($mutex:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal("mutex poisoned".into()))
	};
	($mutex:expr, $name:expr) => {
		$mutex.lock().map_err(|_| {
			::tracing::error!("Mutex poisoned: {}", $name);
			$crate::error::Error::Internal(format!("mutex poisoned: {}", $name))
		})
	};
}


// vim: ts=4
