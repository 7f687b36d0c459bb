//! Webhook intake: signature verification, dedup, and translation of
//! platform events into jobs.

mod intake;
mod payload;
mod signature;

pub use intake::{Ack, Intake, IntakeOutcome};
pub use payload::{WebhookEvent, WebhookHeaders, WebhookPayload};
pub use signature::verify_signature;
