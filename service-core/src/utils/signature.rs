use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Sign `payload` with HMAC-SHA256 and return the standard base64 digest.
pub fn sign_base64(key: &[u8], payload: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(payload.as_bytes());
    let result = mac.finalize();

    Ok(STANDARD.encode(result.into_bytes()))
}

/// Verify a base64 HMAC-SHA256 signature using constant-time comparison
pub fn verify_base64(key: &[u8], payload: &str, signature: &str) -> Result<bool, anyhow::Error> {
    let expected_signature = sign_base64(key, payload)?;
    Ok(constant_time_eq(&expected_signature, signature))
}

/// Compare two secrets without leaking where they first differ.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_generation_and_verification() {
        let key = b"my_secret_key";
        let payload = "r\n2024-01-01T00:00:00Z\n/blob/acct/files/report.pdf";

        let signature = sign_base64(key, payload).unwrap();
        assert!(!signature.is_empty());
        assert!(STANDARD.decode(&signature).is_ok());

        assert!(verify_base64(key, payload, &signature).unwrap());
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signature = sign_base64(b"Jefe", "what do ya want for nothing?").unwrap();
        let expected = STANDARD.encode(
            hex_literal("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"),
        );
        assert_eq!(signature, expected);
    }

    #[test]
    fn test_tampered_payload() {
        let key = b"my_secret_key";
        let signature = sign_base64(key, "read report.pdf").unwrap();

        assert!(!verify_base64(key, "read secrets.pdf", &signature).unwrap());
    }

    #[test]
    fn test_wrong_key() {
        let signature = sign_base64(b"key-one", "payload").unwrap();

        assert!(!verify_base64(b"key-two", "payload", &signature).unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("admin", "admin"));
        assert!(!constant_time_eq("admin", "admin2"));
        assert!(!constant_time_eq("admin", "admiN"));
        assert!(!constant_time_eq("", "x"));
    }

    fn hex_literal(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }
}
