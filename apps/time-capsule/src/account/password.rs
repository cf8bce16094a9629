use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Argon2id hashing with a fresh random salt per password.
#[derive(Clone)]
pub struct PasswordHashing {
    params: Params,
}

impl Default for PasswordHashing {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordHashing {
    /// Custom cost parameters (memory in KiB, iterations, lanes).
    pub fn with_cost(memory_kib: u32, iterations: u32, lanes: u32) -> Result<Self, PasswordError> {
        let params = Params::new(memory_kib, iterations, lanes, None)
            .map_err(|error| PasswordError::Params(error.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Returns the PHC string (`$argon2id$v=19$...`).
    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|error| PasswordError::Hash(error.to_string()))
    }

    /// A malformed stored hash verifies as `false`.
    pub fn verify(&self, password: &str, phc: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(phc) else {
            tracing::warn!("stored password hash is not a valid PHC string");
            return false;
        };
        // Parameters embedded in the PHC string take precedence over ours.
        self.argon2()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::PasswordHashing;

    #[test]
    fn hashes_are_salted_and_verifiable() -> Result<()> {
        let hashing = PasswordHashing::with_cost(1024, 1, 1)?;
        let first = hashing.hash("Sup3rSecret")?;
        let second = hashing.hash("Sup3rSecret")?;

        assert!(first.starts_with("$argon2id$"));
        assert_ne!(first, second);
        assert!(hashing.verify("Sup3rSecret", &first));
        assert!(hashing.verify("Sup3rSecret", &second));
        assert!(!hashing.verify("sup3rsecret", &first));
        assert!(!hashing.verify("Sup3rSecret", "not-a-phc-string"));
        Ok(())
    }
}
