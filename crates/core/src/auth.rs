use std::fmt::Display;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Argon2,
};
use rand::rngs::OsRng;

/// Result type for password hashing operations.
pub type HashResult<T> = Result<T, HashError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// The hashing engine failed to produce a hash.
    Engine(String),
}

impl Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashError::Engine(msg) => write!(f, "Hash error: {msg}"),
        }
    }
}

impl std::error::Error for HashError {}

/// Trait for password hashing engines.
///
/// Implementations are synchronous and CPU bound, callers running on an
/// async runtime should move them to a blocking thread.
pub trait PasswordHasher: Send + Sync {
    /// Hashes `password` with a fresh salt.
    fn hash(&self, password: &str) -> HashResult<String>;

    /// Verifies `password` against a stored hash. A malformed hash never
    /// verifies.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Argon2id hasher producing PHC formatted strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Hasher;

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> HashResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Engine(e.to_string()))
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argon2_hash_and_verify() {
        let hasher = Argon2Hasher;
        let hash = hasher.hash("s3cret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("s3cret", &hash));
        assert!(!hasher.verify("S3cret", &hash));
    }

    #[test]
    fn test_argon2_salted() {
        let hasher = Argon2Hasher;
        let first = hasher.hash("same").unwrap();
        let second = hasher.hash("same").unwrap();
        assert_ne!(first, second);
        assert!(hasher.verify("same", &second));
    }

    #[test]
    fn test_argon2_malformed_hash() {
        let hasher = Argon2Hasher;
        assert!(!hasher.verify("anything", ""));
        assert!(!hasher.verify("anything", "plain-text-password"));
    }

    #[test]
    fn test_hash_error_display() {
        let error = HashError::Engine("boom".to_string());
        assert_eq!(error.to_string(), "Hash error: boom");
    }
}
