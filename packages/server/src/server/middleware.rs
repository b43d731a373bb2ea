//! Operator authentication middleware.
//!
//! Extracts the bearer JWT from the Authorization header and verifies
//! it against the configured secret. Guards the operator-facing
//! maintenance surface; the carrier webhook and scheduling endpoints
//! stay open for their collaborators.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::server::app::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    /// Operator user id.
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

pub async fn operator_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(claims) = extract_claims(&request, &state.deps.config.jwt_secret) else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "UNAUTHORIZED" })),
        )
            .into_response();
    };
    tracing::debug!(operator = %claims.sub, role = %claims.role, "operator authenticated");
    request.extensions_mut().insert(claims);
    next.run(request).await
}

fn extract_claims(request: &Request<Body>, secret: &str) -> Option<OperatorClaims> {
    let auth_header = request.headers().get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;
    let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);

    decode::<OperatorClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn token(exp_offset_secs: i64) -> String {
        let claims = OperatorClaims {
            sub: "ops".to_string(),
            role: "admin".to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn request_with(header: Option<String>) -> Request<Body> {
        let mut builder = Request::builder();
        if let Some(h) = header {
            builder = builder.header("authorization", h);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn accepts_valid_bearer_token() {
        let req = request_with(Some(format!("Bearer {}", token(3600))));
        let claims = extract_claims(&req, SECRET).expect("valid token");
        assert_eq!(claims.sub, "ops");
    }

    #[test]
    fn rejects_expired_and_missing_tokens() {
        let req = request_with(Some(format!("Bearer {}", token(-3600))));
        assert!(extract_claims(&req, SECRET).is_none());

        let req = request_with(None);
        assert!(extract_claims(&req, SECRET).is_none());
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let req = request_with(Some(format!("Bearer {}", token(3600))));
        assert!(extract_claims(&req, "another-secret-another-secret-00").is_none());
    }
}
