//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! router / worker / executor produce:
//!     → logging.rs (structured tracing events, worker spans)
//!     → metrics.rs (command counters, data command latency, live connections)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Every event carries `connection_id` where one exists
//! - Metrics are cheap (atomic increments) and safe to record without an exporter
//! - The exporter is only installed when configured

pub mod logging;
pub mod metrics;
