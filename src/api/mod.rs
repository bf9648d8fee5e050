//! HTTP API surface.

pub mod auth;
pub mod routes;

pub use routes::{serve, AppState};
