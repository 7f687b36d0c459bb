pub mod error;
pub mod id;

pub use error::{ErrorCode, OrchestratorError};
