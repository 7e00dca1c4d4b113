//! Digest helpers for shared-secret checks and certificate fingerprints

use ring::digest::{Context, SHA256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    hex_encode(digest.as_ref())
}

pub fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    sha256_hex(cert_der)
}

/// Checks a handshake key against the configured one.
///
/// With no configured key every client is accepted. Otherwise the provided key
/// must be present and equal; digests are compared rather than raw secrets.
pub fn keys_match(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(provided)) => {
            sha256_hex(expected.as_bytes()) == sha256_hex(provided.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_keys_match() {
        assert!(keys_match(None, None));
        assert!(keys_match(None, Some("anything")));
        assert!(keys_match(Some("abc"), Some("abc")));
        assert!(!keys_match(Some("abc"), None));
        assert!(!keys_match(Some("abc"), Some("abd")));
    }
}
