pub mod metrics;

pub use metrics::{DiskUsage, MemoryUsage, MetricsCollector, MetricsSnapshot};
