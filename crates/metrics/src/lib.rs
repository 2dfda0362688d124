//! Telemetry sink for parley.
//!
//! A thin layer over the `metrics` crate facade: counters (increment-only),
//! gauges (set), histograms (observe). Metric names are flat and namespaced
//! by component; they are centralized in [`definitions`] so dashboards have a
//! single source of truth. The core never queries telemetry — when no
//! recorder is installed, every call is a no-op.
//!
//! ```rust,ignore
//! use parley_metrics::{counter, gauge, names};
//!
//! counter!(names::ws::CONNECTIONS_TOTAL).increment(1);
//! gauge!(names::ws::CONNECTIONS_ACTIVE).set(42.0);
//! ```

pub mod definitions;

pub use definitions as names;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
