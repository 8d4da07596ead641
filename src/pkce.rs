use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE verifier with its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_token::<48>();
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` parameter binding a redirect to its callback.
#[must_use]
pub fn generate_state() -> String {
    random_token::<16>()
}

/// Random `nonce` echoed back in the ID token.
#[must_use]
pub fn generate_nonce() -> String {
    random_token::<16>()
}

fn random_token<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn verifier_is_rfc7636_length_and_url_safe() {
        let pair = PkcePair::generate();
        // 48 random bytes -> 64 base64url chars, inside the 43..=128 window.
        assert_eq!(pair.verifier.len(), 64);
        assert!(url_safe(&pair.verifier), "{}", pair.verifier);
        assert!(url_safe(&pair.challenge), "{}", pair.challenge);
    }

    #[test]
    fn challenge_matches_verifier() {
        let pair = PkcePair::generate();
        assert_eq!(pair.challenge, challenge_for(&pair.verifier));
    }

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn state_and_nonce_are_unique() {
        assert_eq!(generate_state().len(), 22);
        assert_ne!(generate_state(), generate_state());
        assert_ne!(generate_nonce(), generate_nonce());
        assert_ne!(PkcePair::generate().verifier, PkcePair::generate().verifier);
    }
}
