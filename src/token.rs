//! Token minting — URL-safe, high-entropy, single-purpose secrets.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;

/// Entropy for check-in confirmation tokens.
pub const CHECK_IN_TOKEN_BYTES: usize = 32;
/// Entropy for trustee verification tokens.
pub const VERIFICATION_TOKEN_BYTES: usize = 32;
/// Entropy for trustee vault-access tokens.
pub const ACCESS_TOKEN_BYTES: usize = 48;

/// Mints opaque tokens. Injected so tests can observe or fix token values.
pub trait TokenGenerator: Send + Sync {
    /// Produce a URL-safe token from `bytes` of randomness.
    fn mint(&self, bytes: usize) -> String;
}

/// OS-CSPRNG token generator.
pub struct OsRngTokens;

impl TokenGenerator for OsRngTokens {
    fn mint(&self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        OsRng.fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe() {
        let token = OsRngTokens.mint(CHECK_IN_TOKEN_BYTES);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn token_length_tracks_entropy() {
        // base64 without padding: ceil(n * 4 / 3) chars.
        assert_eq!(OsRngTokens.mint(32).len(), 43);
        assert_eq!(OsRngTokens.mint(48).len(), 64);
    }

    #[test]
    fn tokens_are_unique() {
        let a = OsRngTokens.mint(ACCESS_TOKEN_BYTES);
        let b = OsRngTokens.mint(ACCESS_TOKEN_BYTES);
        assert_ne!(a, b);
    }
}
