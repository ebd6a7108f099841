// src/creds.rs
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::{ServerError, ServerResult};

/// Username → Argon2 password hash.
///
/// Optionally seeded from a file at startup; the register endpoint inserts
/// in memory only. Reads dominate, so the map sits behind an RwLock.
pub struct CredStore {
    users: RwLock<HashMap<String, String>>,
}

impl CredStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Seed from a file of `user:argon2hash` lines. Blank lines and lines
    /// starting with `#` are skipped.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut users = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, hash) = line.split_once(':').ok_or_else(|| {
                ServerError::Credentials(format!("{}:{}: missing ':'", path.display(), lineno + 1))
            })?;
            users.insert(user.to_string(), hash.to_string());
        }
        Ok(Self {
            users: RwLock::new(users),
        })
    }

    /// Hash a plaintext password and insert it, replacing any previous entry.
    /// Used for seeding test fixtures and first-run setups.
    pub fn seed_plain(&self, user: &str, password: &str) -> ServerResult<()> {
        let hash = hash_password(password)?;
        self.users
            .write()
            .expect("credential lock poisoned")
            .insert(user.to_string(), hash);
        Ok(())
    }

    /// True when the user exists and the password verifies.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let users = self.users.read().expect("credential lock poisoned");
        match users.get(user) {
            Some(hash) => verify_password(password, hash),
            None => false,
        }
    }

    /// Register a new user. Fails when the name is taken or hashing fails.
    pub fn register(&self, user: &str, password: &str) -> bool {
        let mut users = self.users.write().expect("credential lock poisoned");
        if users.contains_key(user) {
            return false;
        }
        match hash_password(password) {
            Ok(hash) => {
                users.insert(user.to_string(), hash);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users
            .read()
            .expect("credential lock poisoned")
            .contains_key(user)
    }
}

impl Default for CredStore {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_password(password: &str) -> ServerResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServerError::Credentials(format!("failed to hash password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_verify() {
        let store = CredStore::new();
        assert!(store.register("alice", "sesame"));
        assert!(store.verify("alice", "sesame"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "sesame"));
    }

    #[test]
    fn register_rejects_taken_name() {
        let store = CredStore::new();
        assert!(store.register("alice", "one"));
        assert!(!store.register("alice", "two"));
        // Original password still holds.
        assert!(store.verify("alice", "one"));
    }

    #[test]
    fn load_parses_seed_file() {
        let store = CredStore::new();
        store.seed_plain("carol", "hunter2").unwrap();
        let hash = store
            .users
            .read()
            .unwrap()
            .get("carol")
            .cloned()
            .unwrap();

        let path = std::env::temp_dir().join(format!("minnow-creds-{}", std::process::id()));
        std::fs::write(&path, format!("# seeded users\n\ncarol:{}\n", hash)).unwrap();
        let loaded = CredStore::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(loaded.contains("carol"));
        assert!(loaded.verify("carol", "hunter2"));
    }

    #[test]
    fn load_rejects_malformed_lines() {
        let path = std::env::temp_dir().join(format!("minnow-creds-bad-{}", std::process::id()));
        std::fs::write(&path, "no-colon-here\n").unwrap();
        assert!(CredStore::load(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
