//! Observability: Prometheus metrics and tracing setup.

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;
