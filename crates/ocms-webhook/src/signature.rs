//! Webhook signature handling
//!
//! `X-Webhook-Signature` carries the lowercase hex HMAC-SHA256 of the raw
//! request body, keyed with the subscriber's shared secret.

use crate::{Result, WebhookError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature header name
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Event type header name
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Delivery ID header name, used by receivers for deduplication
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-ID";

/// Compute the hex signature of a payload
pub fn sign(payload: &[u8], secret: &str) -> String {
    WebhookSigner::new(secret).sign(payload)
}

/// Check a hex signature against a payload
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    WebhookVerifier::new(secret).verify(payload, signature).is_ok()
}

/// Webhook signer for generating signatures
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl WebhookSigner {
    /// Create a new signer with a secret
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Generate a signature for a payload
    pub fn sign(&self, payload: &[u8]) -> String {
        compute_signature(&self.secret, payload)
    }

    /// Get the signed header set for a delivery
    pub fn headers(
        &self,
        payload: &[u8],
        event_type: &str,
        delivery_id: i64,
    ) -> Vec<(&'static str, String)> {
        vec![
            (SIGNATURE_HEADER, self.sign(payload)),
            (EVENT_HEADER, event_type.to_string()),
            (DELIVERY_ID_HEADER, delivery_id.to_string()),
        ]
    }
}

/// Webhook verifier for validating signatures on the receiving side
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    /// Create a new verifier with a secret
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Verify a webhook signature header against the raw body
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let expected = compute_signature(&self.secret, payload);

        if constant_time_compare(signature_header.trim(), &expected) {
            Ok(())
        } else {
            Err(WebhookError::SignatureVerificationFailed(
                "Signature does not match payload".to_string(),
            ))
        }
    }
}

/// Compute raw HMAC signature
fn compute_signature(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can accept any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

/// Generate a secure random webhook secret
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let secret: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let secret = "test-secret-key";
        let payload = br#"{"type":"page.created"}"#;

        let signature = sign(payload, secret);
        assert!(verify(payload, &signature, secret));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signature = sign(b"what do ya want for nothing?", "Jefe");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let payload = b"same payload";
        assert_eq!(sign(payload, "k"), sign(payload, "k"));
        assert_ne!(sign(payload, "k"), sign(payload, "k2"));
    }

    #[test]
    fn test_wrong_secret() {
        let payload = b"test payload";
        let signature = sign(payload, "secret-1");

        assert!(!verify(payload, &signature, "secret-2"));
    }

    #[test]
    fn test_single_byte_mutations_fail() {
        let secret = "test-secret";
        let payload = b"original payload".to_vec();
        let signature = sign(&payload, secret);

        for i in 0..payload.len() {
            let mut mutated = payload.clone();
            mutated[i] ^= 0x01;
            assert!(!verify(&mutated, &signature, secret), "payload byte {}", i);
        }

        for i in 0..signature.len() {
            let mut mutated = signature.clone().into_bytes();
            mutated[i] = if mutated[i] == b'0' { b'1' } else { b'0' };
            let mutated = String::from_utf8(mutated).unwrap();
            assert!(!verify(&payload, &mutated, secret), "signature byte {}", i);
        }

        let mut mutated_secret = secret.as_bytes().to_vec();
        mutated_secret[0] ^= 0x01;
        let mutated_secret = String::from_utf8(mutated_secret).unwrap();
        assert!(!verify(&payload, &signature, &mutated_secret));
    }

    #[test]
    fn test_uppercase_signature_rejected() {
        let payload = b"payload";
        let signature = sign(payload, "secret").to_uppercase();

        assert!(!verify(payload, &signature, "secret"));
    }

    #[test]
    fn test_verifier_error() {
        let verifier = WebhookVerifier::new("secret");
        let result = verifier.verify(b"payload", "deadbeef");

        assert!(matches!(
            result,
            Err(WebhookError::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn test_headers() {
        let signer = WebhookSigner::new("test-secret");
        let payload = b"test payload";

        let headers = signer.headers(payload, "page.updated", 17);
        assert_eq!(headers.len(), 3);
        assert!(headers
            .iter()
            .any(|(k, v)| *k == SIGNATURE_HEADER && *v == signer.sign(payload)));
        assert!(headers
            .iter()
            .any(|(k, v)| *k == EVENT_HEADER && v == "page.updated"));
        assert!(headers
            .iter()
            .any(|(k, v)| *k == DELIVERY_ID_HEADER && v == "17"));
    }

    #[test]
    fn test_generate_secret() {
        let secret = generate_webhook_secret();
        assert!(secret.starts_with("whsec_"));
        assert_eq!(secret.len(), "whsec_".len() + 64);

        let secret2 = generate_webhook_secret();
        assert_ne!(secret, secret2);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
