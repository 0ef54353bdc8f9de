pub use cadence_types::error::{CdResult, Error};
pub use cadence_types::lock;
pub use cadence_types::task::{TaskEnvelope, TaskInfo, TaskOptions, TaskState};
pub use cadence_types::types::Timestamp;

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
