//! The HTTP edge: webhook intake and health endpoints.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
