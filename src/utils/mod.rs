//! # Utility Modules
//!
//! Supporting utilities shared by the transport and transfer layers.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: process-wide atomic counters
//! - **Time**: wall-clock timestamps for records
//! - **Timeout**: async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use metrics::{global_metrics, MetricsSnapshot};
