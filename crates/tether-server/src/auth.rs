//! Connection authentication.
//!
//! Clients authenticate by presenting a signed token in the WebSocket
//! path. Verification happens before any session state is created; a bad
//! token gets one `error` frame and a policy-violation close.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Signature, expiry, or shape of the token is invalid.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// The token verified but carries no usable identity.
    #[error("token has no subject")]
    MissingSubject,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Verifies a connection token and extracts the identity it binds.
pub trait TokenVerifier: Send + Sync {
    /// Verify the token and return the authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the token cannot be trusted.
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with the given secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn token_for(sub: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let verifier = JwtVerifier::new(SECRET);
        let identity = verifier.verify(&token_for("u42", 3600)).unwrap();
        assert_eq!(identity, "u42");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&token_for("u42", -3600)),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::new(b"other-secret");
        assert!(verifier.verify(&token_for("u42", 3600)).is_err());
    }

    #[test]
    fn test_empty_subject_is_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&token_for("", 3600)),
            Err(AuthError::MissingSubject)
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(verifier.verify("not-a-token").is_err());
    }
}
