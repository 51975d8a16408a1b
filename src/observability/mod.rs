//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Filters, CONNECT interceptor, relay, server loop produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Connection IDs and request IDs appear as structured fields
//! - Metric updates are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
