//! Operator authentication for the administrative surface.
//!
//! A single static operator credential supplied as `ADMIN_TOKEN` and
//! presented as `Authorization: Bearer <token>`. Comparison is constant
//! time. When no token is configured, operator endpoints refuse every
//! request rather than falling open.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::routes::AppState;

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware gating operator endpoints on the configured credential.
pub async fn require_operator(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator access is not configured".to_string(),
        ));
    };

    match bearer_token(&req) {
        Some(token) if constant_time_eq(token, expected) => Ok(next.run(req).await),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            "Invalid operator credential".to_string(),
        )),
    }
}
