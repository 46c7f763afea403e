//! API key authentication.
//!
//! The emulated API accepts `Authorization: Bearer <key>` or
//! `Authorization: Basic <base64>` (key is the text before the first colon).
//! In lenient mode (the default) any non-empty key passes; strict mode
//! requires the `sk_test_` / `sk_live_` shape. Admin (`/_config/`) routes and
//! CORS preflights are exempt.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Method;

use crate::error::ApiError;
use crate::middleware::Next;
use crate::responder::Responder;
use crate::types::{Request, Response};

/// Key validation policy.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::auth::AuthPolicy;
/// use paper_tiger::config::ServerConfig;
///
/// let config = ServerConfig {
///     auth_policy: AuthPolicy::Strict,
///     ..ServerConfig::default()
/// };
/// assert_eq!(config.auth_policy, AuthPolicy::Strict);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Any non-empty key.
    Lenient,
    /// Keys must start with `sk_test_` or `sk_live_`.
    Strict,
}

/// Extracts the API key from an `Authorization` header value.
///
/// `Bearer <key>` yields the key directly; `Basic <base64>` is decoded and
/// the key is the text before the first colon. Anything else — including an
/// empty key — yields `None`.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::auth::extract_key;
///
/// assert_eq!(extract_key("Bearer sk_test_abc").as_deref(), Some("sk_test_abc"));
/// // "sk_test_abc:" base64-encoded
/// assert_eq!(extract_key("Basic c2tfdGVzdF9hYmM6").as_deref(), Some("sk_test_abc"));
/// assert_eq!(extract_key("Token whatever"), None);
/// ```
pub fn extract_key(header: &str) -> Option<String> {
    if let Some(key) = header.strip_prefix("Bearer ") {
        let key = key.trim();
        return (!key.is_empty()).then(|| key.to_string());
    }
    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let key = text.split(':').next().unwrap_or("");
        return (!key.is_empty()).then(|| key.to_string());
    }
    None
}

fn validate(key: &str, policy: AuthPolicy) -> Result<(), ApiError> {
    match policy {
        AuthPolicy::Lenient => Ok(()),
        AuthPolicy::Strict => {
            if key.starts_with("sk_test_") || key.starts_with("sk_live_") {
                Ok(())
            } else {
                Err(ApiError::authentication(format!(
                    "Invalid API Key provided: {key}"
                )))
            }
        }
    }
}

/// Auth middleware.
///
/// Rejections render as the 401 `invalid_request_error` envelope. OPTIONS
/// preflights and the `/_config/` admin surface pass through unchecked —
/// preflights carry no credentials, and the admin endpoints sit outside the
/// emulated API.
pub async fn handle(policy: AuthPolicy, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS || req.uri().path().starts_with("/_config/") {
        return next.run(req).await;
    }
    let header = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let key = match header.and_then(extract_key) {
        Some(key) => key,
        None => {
            return ApiError::authentication(
                "You did not provide an API key. Provide it using \
                 'Authorization: Bearer sk_test_...' or HTTP Basic auth.",
            )
            .into_response();
        }
    };
    if let Err(err) = validate(&key, policy) {
        return err.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_keys_extract() {
        assert_eq!(extract_key("Bearer sk_test_abc").as_deref(), Some("sk_test_abc"));
        assert_eq!(extract_key("Bearer "), None);
    }

    #[test]
    fn basic_keys_take_text_before_colon() {
        let encoded = BASE64.encode("sk_test_abc:");
        assert_eq!(
            extract_key(&format!("Basic {encoded}")).as_deref(),
            Some("sk_test_abc")
        );
        let no_colon = BASE64.encode("sk_test_xyz");
        assert_eq!(
            extract_key(&format!("Basic {no_colon}")).as_deref(),
            Some("sk_test_xyz")
        );
    }

    #[test]
    fn malformed_headers_yield_nothing() {
        assert_eq!(extract_key("Token abc"), None);
        assert_eq!(extract_key("Basic %%%"), None);
        assert_eq!(extract_key(""), None);
    }

    #[test]
    fn strict_mode_requires_secret_key_shape() {
        assert!(validate("sk_test_123", AuthPolicy::Strict).is_ok());
        assert!(validate("sk_live_123", AuthPolicy::Strict).is_ok());
        assert!(validate("pk_test_123", AuthPolicy::Strict).is_err());
        assert!(validate("whatever", AuthPolicy::Lenient).is_ok());
    }
}
