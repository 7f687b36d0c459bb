//! HMAC-SHA256 webhook signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::common::OrchestratorError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature header over the raw body.
///
/// Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature_header: &str,
) -> Result<(), OrchestratorError> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| OrchestratorError::Validation("bad_signature".to_string()))?;

    let expected = hex::decode(hex_digest)
        .map_err(|_| OrchestratorError::Validation("bad_signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| OrchestratorError::Validation("bad_signature".to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| OrchestratorError::Validation("bad_signature".to_string()))
}

/// Compute the signature header value for a body. Test and client use.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"action":"queued"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &header).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"action":"queued"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("othersecret", body, &header).is_err());
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("topsecret", b"original");
        assert!(verify_signature("topsecret", b"tampered", &header).is_err());
    }

    #[test]
    fn missing_prefix_fails() {
        let err = verify_signature("s", b"x", "deadbeef").unwrap_err();
        assert!(err.to_string().contains("bad_signature"));
    }

    #[test]
    fn non_hex_digest_fails() {
        assert!(verify_signature("s", b"x", "sha256=zzzz").is_err());
    }
}
