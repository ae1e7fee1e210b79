//! Common utilities and types shared across minifleet

pub mod conditions;
pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use conditions::{Condition, ConditionKind, ConditionLog};
pub use config::{ControllerConfig, LogFormat};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{format_bytes, timestamp_now_millis, RetryPolicy};
