//! Handshake authentication and session tracking

mod session;

pub use session::*;

use tether_common::{crypto, PROTOCOL_VERSION, STATUS_BAD_REQUEST, STATUS_UNAUTHORIZED};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Protocol version mismatch. Server: {server}, Client: {client}")]
    VersionMismatch { server: u8, client: u8 },
    #[error("Invalid or missing key")]
    InvalidKey,
}

impl AuthError {
    /// Status code carried by the rejection ack.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::VersionMismatch { .. } => STATUS_BAD_REQUEST,
            AuthError::InvalidKey => STATUS_UNAUTHORIZED,
        }
    }
}

/// Validates a handshake against the server's protocol version and shared key.
pub fn authenticate(
    expected_key: Option<&str>,
    version: u8,
    provided_key: Option<&str>,
) -> Result<(), AuthError> {
    if version != PROTOCOL_VERSION {
        return Err(AuthError::VersionMismatch {
            server: PROTOCOL_VERSION,
            client: version,
        });
    }

    if !crypto::keys_match(expected_key, provided_key) {
        return Err(AuthError::InvalidKey);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_unauthorized() {
        let err = authenticate(Some("abc"), PROTOCOL_VERSION, None).unwrap_err();
        assert!(matches!(err, AuthError::InvalidKey));
        assert_eq!(err.status(), STATUS_UNAUTHORIZED);
    }

    #[test]
    fn test_open_server_accepts_anyone() {
        assert!(authenticate(None, PROTOCOL_VERSION, None).is_ok());
        assert!(authenticate(Some("abc"), PROTOCOL_VERSION, Some("abc")).is_ok());
    }

    #[test]
    fn test_version_mismatch() {
        let err = authenticate(None, PROTOCOL_VERSION + 1, None).unwrap_err();
        assert_eq!(err.status(), STATUS_BAD_REQUEST);
    }
}
