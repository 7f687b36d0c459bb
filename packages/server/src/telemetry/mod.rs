//! Telemetry taps: named events and metric samples.
//!
//! Components receive sink handles at construction and never touch a
//! global registry. The default sinks write structured `tracing` lines;
//! tests swap in collecting sinks and assert on what was emitted.

mod events;
mod sinks;

pub use events::{AlertSeverity, OrchestratorEvent};
pub use sinks::{
    CollectingEventSink, CollectingMetricsSink, EventSink, LogEventSink, LogMetricsSink,
    MetricsSink,
};
