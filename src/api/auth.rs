// =============================================================================
// Dashboard Authentication — bearer token extractor
// =============================================================================
//
// Run views need `Authorization: Bearer <token>` where the token is the
// configured `api.admin_token` (`BASIS_ADMIN_TOKEN` overrides it at startup).
// With no token configured every guarded request is refused.
//
//   async fn handler(_auth: AdminAuth, State(state): State<Arc<AppState>>) { ... }

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::app_state::AppState;

pub type AuthRejection = (StatusCode, Json<Value>);

/// Marker extractor: present in a handler's arguments only when the request
/// carried the admin token.
pub struct AdminAuth;

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        check_bearer(&parts.headers, state.runtime_config.api.admin_token())?;
        Ok(AdminAuth)
    }
}

/// Accept `headers` only if they carry `Bearer <expected>`.
fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthRejection> {
    let Some(expected) = expected else {
        warn!("admin token not configured; rejecting dashboard request");
        return Err(forbidden("Server authentication not configured"));
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        None => {
            warn!("missing or malformed Authorization header");
            Err(forbidden("Missing or invalid authorization token"))
        }
        Some(token) if !constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            warn!("invalid admin token presented");
            Err(forbidden("Invalid authorization token"))
        }
        Some(_) => Ok(()),
    }
}

fn forbidden(message: &str) -> AuthRejection {
    (StatusCode::FORBIDDEN, Json(json!({ "error": message })))
}

/// Equality that looks at every byte of equal-length inputs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
