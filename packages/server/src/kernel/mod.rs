//! The orchestration kernel: every core component and the control loop
//! that wires them together.

pub mod docker;
pub mod intake;
pub mod jobs;
pub mod orchestrator;
pub mod pools;
pub mod reaper;
pub mod router;
pub mod scaler;
pub mod scanner;
pub mod schedules;
pub mod service_host;

pub use orchestrator::Orchestrator;
pub use service_host::{HealthRegistry, Service, ServiceHost};
