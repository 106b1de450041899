use hearth_core::HttpError;

/// Default bcrypt cost: 2^11 rounds.
pub const DEFAULT_COST: u32 = 11;

/// Hash a password with the configured cost.
pub fn hash_password(password: &str, cost: u32) -> Result<String, HttpError> {
    bcrypt::hash(password, cost)
        .map_err(|e| HttpError::Internal(format!("password hash failed: {e}")))
}

/// Verify a password against a stored bcrypt hash. Malformed hashes count
/// as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimum legal cost keeps the tests fast; production uses the default.
    const TEST_COST: u32 = 4;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("s3cret", TEST_COST).unwrap();
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same", TEST_COST).unwrap();
        let b = hash_password("same", TEST_COST).unwrap();
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
        assert!(!verify_password("anything", ""));
    }
}
