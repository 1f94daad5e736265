//! Authentication for the Lingkar API.
//!
//! Two mechanisms: bearer JWTs (HS256) for the interactive surface, and an
//! HMAC signature header for gateway webhooks. The middleware turns a valid
//! token into a [`Principal`] request extension; handlers never look at the
//! token themselves.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use lingkar_billing::Principal;

use crate::error::ApiError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Issued tokens live for a day; admin consoles re-login.
const TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Webhook signatures older (or newer) than this are replays.
const SIGNATURE_MAX_AGE_SECONDS: i64 = 300;

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Acting user.
    pub sub: Uuid,
    /// Tenant the actor administers.
    pub tenant_id: Uuid,
    #[serde(default)]
    pub platform_admin: bool,
    pub iat: i64,
    pub exp: i64,
}

/// Encodes and validates platform bearer tokens.
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token for an actor administering `tenant_id`.
    pub fn issue(
        &self,
        actor_id: Uuid,
        tenant_id: Uuid,
        platform_admin: bool,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: actor_id,
            tenant_id,
            platform_admin,
            iat: now,
            exp: now + TOKEN_TTL_SECONDS,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a token and return its claims. Expiry is enforced.
    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Principal {
            actor_id: claims.sub,
            tenant_id: claims.tenant_id,
            platform_admin: claims.platform_admin,
        }
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Middleware that requires a valid bearer token.
///
/// On success the request gains a `Principal` extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "require_auth: no bearer token");
        return ApiError::Unauthorized.into_response();
    };

    match state.jwt_manager.validate(token) {
        Ok(claims) => {
            let principal = Principal::from(claims);
            tracing::debug!(
                path = %path,
                actor_id = %principal.actor_id,
                tenant_id = %principal.tenant_id,
                platform_admin = principal.platform_admin,
                "require_auth: authenticated"
            );
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "require_auth: token rejected");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Verify a gateway webhook signature header.
///
/// Header format: `t=<unix seconds>,v1=<hex hmac>`, where the HMAC-SHA256 is
/// taken over `{timestamp}.{raw body}` with the shared webhook secret. The
/// timestamp must be within [`SIGNATURE_MAX_AGE_SECONDS`] of `now`, so a
/// captured request cannot be replayed later.
pub fn verify_webhook_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: OffsetDateTime,
) -> bool {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let mut iter = part.trim().splitn(2, '=');
        let key = iter.next().unwrap_or("");
        let value = iter.next().unwrap_or("");
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };
    if signatures.is_empty() {
        return false;
    }

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_MAX_AGE_SECONDS {
        return false;
    }

    let signed_payload = format!("{timestamp}.{}", String::from_utf8_lossy(payload));
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    signatures.iter().any(|sig| *sig == expected)
}
