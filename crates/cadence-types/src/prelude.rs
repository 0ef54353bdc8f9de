pub use crate::error::{CdResult, Error};
pub use crate::lock;
pub use crate::task::{TaskEnvelope, TaskInfo, TaskOptions, TaskState};
pub use crate::types::Timestamp;

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
