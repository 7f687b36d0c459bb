//! Container orchestration: one runner container per job.
//!
//! - [`ContainerSpec`] + allow-list validation and security defaults
//! - [`DockerClient`] - the engine-socket wrapper (semaphore-bounded)
//! - [`ContainerRecord`] - the durable container registry row
//! - stats derivation and the monitoring/alerting loop

mod client;
mod container;
mod events;
mod monitor;
mod spec;
mod stats;

pub use client::{DockerClient, EngineEvent, LABEL_MANAGED, LABEL_POOL, MANAGED_VALUE};
pub use container::{ContainerRecord, ContainerState};
pub use events::EventWatcher;
pub use monitor::{AlertKind, AlertState, ContainerMonitor};
pub use spec::ContainerSpec;
pub use stats::{RawStats, StatsSnapshot};
