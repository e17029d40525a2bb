//! Authentication of inbound webhook triggers.
//!
//! A webhook workflow may require either:
//! - an HMAC-SHA256 signature of the raw body in `X-Signature-256: sha256=<hex>`
//! - a bearer token in `Authorization: Bearer <token>`
//!
//! Secrets never live in the workflow definition; the trigger config names an
//! environment variable and the value is read at request time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stratum_types::workflow::WebhookAuth;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WebhookError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("signature does not match request body")]
    BadSignature,

    #[error("bearer token rejected")]
    BadToken,

    /// The env var named by the trigger is unset; the request cannot be checked.
    #[error("webhook secret {0} is not configured")]
    SecretUnavailable(String),

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),
}

/// The parts of an inbound request that authentication looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookRequest<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub authorization: Option<&'a str>,
}

/// Authenticate a request, reading secrets from the process environment.
pub fn authenticate(
    auth: Option<&WebhookAuth>,
    request: &WebhookRequest<'_>,
) -> Result<(), WebhookError> {
    authenticate_with(auth, request, |var| std::env::var(var).ok())
}

/// Authenticate a request with an explicit secret lookup.
pub fn authenticate_with(
    auth: Option<&WebhookAuth>,
    request: &WebhookRequest<'_>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), WebhookError> {
    let secret = |var: &str| {
        lookup(var)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WebhookError::SecretUnavailable(var.to_string()))
    };

    match auth {
        None => Ok(()),
        Some(WebhookAuth::HmacSha256 { secret_env }) => {
            let key = secret(secret_env.as_str())?;
            let header = request
                .signature
                .ok_or(WebhookError::MissingHeader("X-Signature-256"))?;
            verify_signature(key.as_bytes(), request.body, header)
        }
        Some(WebhookAuth::BearerToken { token_env }) => {
            let expected = secret(token_env.as_str())?;
            let header = request
                .authorization
                .ok_or(WebhookError::MissingHeader("Authorization"))?;
            verify_bearer_token(&expected, header)
        }
    }
}

/// Compute the `sha256=<hex>` signature for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", to_hex(&mac.finalize().into_bytes())))
}

/// Check a `sha256=<hex>` header against `body`. Comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> Result<(), WebhookError> {
    let hex = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(WebhookError::BadSignature)?;
    let expected = from_hex(hex).ok_or(WebhookError::BadSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::BadSignature)
}

/// Check an `Authorization: Bearer <token>` header. Comparison is constant-time.
pub fn verify_bearer_token(expected: &str, header: &str) -> Result<(), WebhookError> {
    let token = header
        .trim()
        .strip_prefix("Bearer ")
        .ok_or(WebhookError::BadToken)?;
    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::BadToken)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
