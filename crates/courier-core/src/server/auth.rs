//! Username/password authentication.

use crate::{CourierError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Credential store. Passwords are kept as salted SHA-256 digests.
///
/// An authenticator without users is inactive: clients are never asked to
/// authenticate.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>, password: &str) -> Self {
        self.add_user(user, password);
        self
    }

    pub fn add_user(&mut self, user: impl Into<String>, password: &str) {
        let user = user.into();
        let digest = password_digest(&user, password);
        self.users.insert(user, digest);
    }

    pub fn is_active(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        let digest = password_digest(user, password);
        self.users
            .get(user)
            .is_some_and(|stored| constant_time_eq(stored.as_bytes(), digest.as_bytes()))
    }

    /// Split an authentication payload `"<user>\n<password>"`.
    pub fn parse_credentials(payload: &str) -> Result<(&str, &str)> {
        payload
            .split_once('\n')
            .filter(|(user, _)| !user.is_empty())
            .ok_or_else(|| {
                CourierError::invalid_message("credentials must be '<user>\\n<password>'")
            })
    }

    pub fn encode_credentials(user: &str, password: &str) -> String {
        format!("{}\n{}", user, password)
    }
}

fn password_digest(user: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
