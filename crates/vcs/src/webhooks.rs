//! Webhook signature verification and normalized event types.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify an HMAC-SHA256 webhook signature.
///
/// # Arguments
/// * `body` - Raw webhook body bytes
/// * `signature` - Hex-encoded signature, optionally prefixed with `sha256=`
/// * `secret` - Webhook signing secret
///
/// # Returns
/// `true` if signature is valid, `false` otherwise
#[must_use]
pub fn verify_hmac_sha256(body: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Compare a shared-secret token header against the configured secret.
#[must_use]
pub fn verify_token(presented: &str, secret: &str) -> bool {
    presented.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Compute the `sha256=<hex>` signature header value for a body.
#[must_use]
pub fn sign_hmac_sha256(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Headers common to provider webhook deliveries.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// Unique delivery ID
    pub delivery_id: Option<String>,
    /// Event type
    pub event_type: Option<String>,
    /// Signature or shared token
    pub signature: Option<String>,
}

impl WebhookHeaders {
    /// Read the named headers from a request.
    #[must_use]
    pub fn from_header_map(
        headers: &HeaderMap,
        delivery: &str,
        event: &str,
        signature: &str,
    ) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        Self {
            delivery_id: get(delivery),
            event_type: get(event),
            signature: get(signature),
        }
    }
}

/// A release published on a provider, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub provider: String,
    /// Repository id on the provider.
    pub repository_id: String,
    pub repository_full_name: String,
    /// Release id on the provider, when it issues one.
    pub release_id: Option<String>,
    pub tag: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub sender_id: Option<String>,
    pub sender_login: Option<String>,
    /// Source archive URL advertised by the provider.
    pub archive_url: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
}

/// A push to a branch or tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub provider: String,
    pub repository_id: String,
    pub repository_full_name: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub head_commit: Option<String>,
    pub sender_login: Option<String>,
}

/// Result of parsing a provider delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Connectivity check sent when a hook is created.
    Ping,
    Release(ReleaseEvent),
    Push(PushEvent),
    /// Event we do not act on, with the reason.
    Ignored(String),
}

impl WebhookEvent {
    #[must_use]
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_signature_valid() {
        let body = b"test payload";
        let secret = "test-secret";

        let signature = sign_hmac_sha256(body, secret);
        assert!(signature.starts_with("sha256="));
        assert!(verify_hmac_sha256(body, &signature, secret));

        // Bare hex is accepted too
        let bare = signature.trim_start_matches("sha256=");
        assert!(verify_hmac_sha256(body, bare, secret));
    }

    #[test]
    fn test_verify_signature_invalid() {
        let body = b"test payload";
        let wrong = "sha256=0000000000000000000000000000000000000000000000000000000000000000";

        assert!(!verify_hmac_sha256(body, wrong, "test-secret"));
        assert!(!verify_hmac_sha256(body, "not-hex", "test-secret"));

        let other_secret = sign_hmac_sha256(body, "other");
        assert!(!verify_hmac_sha256(body, &other_secret, "test-secret"));
    }

    #[test]
    fn test_verify_token() {
        assert!(verify_token("s3cret", "s3cret"));
        assert!(!verify_token("s3cret", "s3cre"));
        assert!(!verify_token("", "s3cret"));
    }

    #[test]
    fn test_headers_from_map() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("release"));
        headers.insert("x-github-delivery", HeaderValue::from_static("abc-123"));

        let parsed = WebhookHeaders::from_header_map(
            &headers,
            "x-github-delivery",
            "x-github-event",
            "x-hub-signature-256",
        );
        assert_eq!(parsed.event_type.as_deref(), Some("release"));
        assert_eq!(parsed.delivery_id.as_deref(), Some("abc-123"));
        assert!(parsed.signature.is_none());
    }
}
