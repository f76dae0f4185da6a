//! API-key authentication for the public surface.
//!
//! Keys are `sk_`-prefixed; the first eight characters select candidate
//! rows in O(1) and the bcrypt verification over all candidates decides,
//! without an early exit, which one (if any) the caller holds. Revoked and
//! expired keys never come back from the candidate query.

use anyhow::{Result, anyhow};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use deadpool_postgres::Pool;
use uuid::Uuid;

use tessera_common::{rate_limit::middleware::RateLimitKey, response, secrets};

use crate::app::App;
use crate::db;
use crate::models::ApiKeyRecord;

/// Authenticated caller, stored in request extensions by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: Uuid,
    pub organization_id: Uuid,
}

/// Resolve an API key to its record, or `None` when it does not verify.
pub async fn authenticate_api_key(pool: &Pool, key: &str) -> Result<Option<ApiKeyRecord>> {
    if !key.starts_with("sk_") || key.len() <= secrets::API_KEY_PREFIX_LEN {
        return Ok(None);
    }
    let prefix = secrets::key_prefix(key);
    let candidates = db::find_api_key_candidates(pool, prefix).await?;
    let pairs: Vec<(ApiKeyRecord, String)> = candidates
        .into_iter()
        .filter(|record| {
            secrets::constant_time_eq(record.key_prefix.as_bytes(), prefix.as_bytes())
        })
        .map(|record| {
            let hash = record.key_hash.clone();
            (record, hash)
        })
        .collect();
    Ok(secrets::verify_any(key, &pairs).cloned())
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// Axum middleware: authenticate and stash the caller. The caller's quota
/// key rides along in the extensions for the rate-limit layer beneath.
pub async fn require_api_key(State(app): State<App>, mut req: Request, next: Next) -> Response {
    let Some(key) = extract_key(req.headers()) else {
        return response::unauthorized(anyhow!("missing API key"));
    };
    let record = match authenticate_api_key(&app.pg, &key).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            metrics::counter!("auth_rejected_total").increment(1);
            return response::unauthorized(anyhow!("unknown or revoked API key"));
        }
        Err(e) => return response::internal_server_error(e),
    };

    req.extensions_mut().insert(RateLimitKey {
        key: format!("key:{}", record.id),
        long_limit: Some(record.rate_limit),
    });
    req.extensions_mut().insert(AuthContext {
        api_key_id: record.id,
        organization_id: record.organization_id,
    });
    next.run(req).await
}

/// Extractor usage: `Caller(caller): Caller`
pub struct Caller(pub AuthContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let ctx = parts.extensions.get::<AuthContext>().cloned();
        async move {
            ctx.map(Caller).ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "AuthContext missing (did you add the middleware?)",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_wins_over_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk_abc123".parse().unwrap());
        headers.insert("x-api-key", "sk_other".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("sk_abc123"));
    }

    #[test]
    fn falls_back_to_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk_other".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("sk_other"));
        assert_eq!(extract_key(&HeaderMap::new()), None);
    }
}
