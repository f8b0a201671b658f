//! Identifier and token generation
//!
//! Tunnel ids are short human-friendly strings; connection ids and per-session
//! unique ids are uuids, globally unique within the allocating process. The
//! listening side allocates connection ids and the dialing side adopts them
//! verbatim.

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

/// Generate a random alphanumeric string of the given length.
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Short id for a tunnel, used when the operator does not name one.
pub fn generate_tunnel_id() -> String {
    random_string(crate::TUNNEL_ID_LEN)
}

/// Id for a single TCP connection, allocated by the listening side.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Per-session unique id, generated fresh by the agent for each connect and
/// appended to the bearer token.
pub fn generate_unique_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Pre-shared bearer token for a registered agent.
pub fn generate_token() -> String {
    random_string(crate::TOKEN_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_length_and_charset() {
        let id = generate_tunnel_id();
        assert_eq!(id.len(), crate::TUNNEL_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
    }

    #[test]
    fn test_token_length_in_window() {
        let token = generate_token();
        assert!(token.len() >= 32 && token.len() <= 48);
        // Tokens are split on '-' when parsing the bearer header, so the
        // alphanumeric charset must never produce one.
        assert!(!token.contains('-'));
    }

    #[test]
    fn test_unique_ids_fresh() {
        assert_ne!(generate_unique_id(), generate_unique_id());
    }
}
