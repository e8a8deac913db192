//! NATS connectivity for cross-process deployments
//!
//! Contexts in different processes share the leader claim through a JetStream
//! key-value bucket and relay bus traffic over core NATS subjects.

pub mod client;

pub use client::NatsClient;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

/// Encode an arbitrary name into a single NATS-safe token
///
/// Scopes are endpoint origins (`ws://host:port`) and contain characters that
/// are not legal in KV keys or subject tokens.
pub fn encode_token(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name.as_bytes())
}

/// Decode a token produced by [`encode_token`]
pub fn decode_token(token: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_subject_safe() {
        let token = encode_token("leader:ws://localhost:8787");
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(
            decode_token(&token).as_deref(),
            Some("leader:ws://localhost:8787")
        );
    }

    #[test]
    fn test_decode_garbage() {
        assert_eq!(decode_token("***"), None);
    }
}
