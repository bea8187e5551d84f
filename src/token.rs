//! Patient portal access tokens
//!
//! A token is 32 bytes from the OS CSPRNG, hex-encoded to 64 lowercase
//! characters. Tokens are stored uniquely on the patient row and are never
//! rotated once issued.

use rand::rngs::OsRng;
use rand::RngCore;

/// Random bytes per token
pub const TOKEN_BYTES: usize = 32;

/// Length of the encoded token
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// Generate a fresh access token
pub fn generate_access_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cheap shape check before touching the database
pub fn looks_like_token(candidate: &str) -> bool {
    candidate.len() == TOKEN_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Shareable portal link for a token.
///
/// `base_url` is the public origin of the portal, e.g. `https://clinic.example`.
pub fn portal_link(base_url: &str, token: &str) -> String {
    format!("{}/portal/login/{}", base_url.trim_end_matches('/'), token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_shape() {
        let token = generate_access_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(looks_like_token(&token));
        assert_eq!(token, token.to_lowercase());
    }

    #[test]
    fn test_tokens_are_distinct() {
        let tokens: HashSet<String> = (0..10_000).map(|_| generate_access_token()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn test_looks_like_token_rejects_garbage() {
        assert!(!looks_like_token(""));
        assert!(!looks_like_token("abc"));
        assert!(!looks_like_token(&"G".repeat(TOKEN_LEN)));
        assert!(!looks_like_token(&"A".repeat(TOKEN_LEN)));
    }

    #[test]
    fn test_portal_link() {
        assert_eq!(
            portal_link("https://clinic.example/", "abc"),
            "https://clinic.example/portal/login/abc"
        );
    }
}
