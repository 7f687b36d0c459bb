//! Orchestrator for ephemeral, containerized CI job runners.
//!
//! Webhook deliveries become durable jobs, jobs flow through a
//! priority queue engine into per-repository runner pools, each job
//! runs in exactly one locked-down container, and the fleet resizes
//! itself against demand. See `kernel` for the components and
//! `conveyor` for the queue engine.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;
pub mod telemetry;

pub use config::Config;
