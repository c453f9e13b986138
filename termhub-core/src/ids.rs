//! Opaque identifier generation. Session ids are 96 bits of randomness
//! rendered as 24 lowercase hex chars; connection ids are 64 bits
//! rendered as 16 lowercase hex chars (spec §6.1).

use rand::RngCore;

pub fn new_session_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

pub fn new_connection_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Validate a client identifier against spec §6.1:
/// `[A-Za-z0-9:_-]{1,128}`.
pub fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_24_lowercase_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn connection_ids_are_16_lowercase_hex_chars() {
        let id = new_connection_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn client_id_validation() {
        assert!(is_valid_client_id("alice"));
        assert!(is_valid_client_id("alice:workstation-1"));
        assert!(!is_valid_client_id(""));
        assert!(!is_valid_client_id("has a space"));
        assert!(!is_valid_client_id(&"a".repeat(129)));
    }
}
