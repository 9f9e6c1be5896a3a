//! API middleware
//!
//! Bearer-token authentication driven by environment variables:
//! `CONDUCTOR_API_TOKEN` holds the token, `CONDUCTOR_REQUIRE_AUTH` forces
//! authentication even when no token is configured (rejecting everything,
//! which is safer than running open by accident). The health endpoint is
//! exempt so load-balancer probes work without credentials.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

fn require_auth() -> bool {
    std::env::var("CONDUCTOR_REQUIRE_AUTH")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Constant-time token comparison; the check must not leak length or
/// prefix information through timing.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub async fn auth_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let token = std::env::var("CONDUCTOR_API_TOKEN").ok();
    match token {
        None => {
            if require_auth() {
                tracing::warn!("CONDUCTOR_REQUIRE_AUTH is set but no token is configured");
                return Err(StatusCode::UNAUTHORIZED);
            }
            Ok(next.run(request).await)
        }
        Some(expected) => {
            let presented = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            match presented {
                Some(presented) if token_matches(presented, &expected) => {
                    Ok(next.run(request).await)
                }
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        }
    }
}
