//! Bearer-token authentication (§6 "Auth").
//!
//! Grounded in the teacher's SHA-256 + `subtle::ConstantTimeEq` bearer-token
//! check, adapted to a single token minted once per daemon lifetime (§4.9)
//! instead of a persisted multi-user credential store. Accepted from either
//! the `Authorization: Bearer <token>` header or a `?token=` query
//! parameter, since the WebSocket/SSE clients in browsers can't always set
//! custom headers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::daemon::state_file::DaemonToken;

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

fn hash(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Constant-time comparison of a candidate token against the daemon's
/// minted token: both are hashed to a fixed-size digest first so the
/// comparison's timing depends on neither the candidate's length nor its
/// content (§6).
pub fn verify(expected: &str, candidate: &str) -> bool {
    hash(expected).ct_eq(&hash(candidate)).into()
}

pub async fn require_bearer_token(
    State(token): State<Arc<DaemonToken>>,
    Query(query): Query<TokenQuery>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let header_token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let candidate = header_token.or(query.token.as_deref());

    match candidate {
        Some(candidate) if verify(&token.0, candidate) => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_token() {
        assert!(verify("secret-token", "secret-token"));
    }

    #[test]
    fn verify_rejects_mismatched_token() {
        assert!(!verify("secret-token", "wrong-token"));
        assert!(!verify("secret-token", ""));
        assert!(!verify("secret-token", "secret-tokenX"));
    }
}
