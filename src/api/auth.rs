// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Extracts and validates a Bearer token from the `Authorization` header
// against `NIGHTSTALKER_ADMIN_TOKEN`. Comparison is performed in constant
// time.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// A missing or invalid token short-circuits the request with 403 Forbidden
// before the handler body executes.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const ENV_ADMIN_TOKEN: &str = "NIGHTSTALKER_ADMIN_TOKEN";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. A length mismatch returns early;
/// the expected token length is not secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check the raw `Authorization` header value against `expected`.
fn check_header(header: Option<&str>, expected: &str) -> Result<(), AuthRejection> {
    if expected.is_empty() {
        warn!("{ENV_ADMIN_TOKEN} is not set — all authenticated requests will be rejected");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Server authentication not configured",
        });
    }

    let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
        Some(t) => t,
        None => {
            warn!("Missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing or invalid authorization token",
            });
        }
    };

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("Invalid admin token presented");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Invalid authorization token",
        });
    }
    Ok(())
}

// =============================================================================
// Extractor
// =============================================================================

/// Validates `Authorization: Bearer <token>`. Read on every request so a
/// rotated token takes effect without a restart.
pub struct AuthBearer;

/// Rejection type returned when authentication fails.
#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ENV_ADMIN_TOKEN).unwrap_or_default();
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        check_header(header, &expected)?;
        Ok(AuthBearer)
    }
}

// =============================================================================
// Tests
// =============================================================================
