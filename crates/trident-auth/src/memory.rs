//! In-memory authentication backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::hash::sha224_hex;
use crate::{Authenticator, User};

/// Authenticator backed by an in-process map, suitable for a fixed password
/// list from the configuration file.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    users: RwLock<HashMap<String, Arc<User>>>,
}

impl MemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from plaintext passwords.
    pub fn from_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let users = passwords
            .into_iter()
            .map(|p| {
                let hash = sha224_hex(p.as_ref());
                (hash.clone(), Arc::new(User::new(hash)))
            })
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Build from pre-computed hashes.
    pub fn from_hashes<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users = hashes
            .into_iter()
            .map(|h| {
                let hash = h.into().to_ascii_lowercase();
                (hash.clone(), Arc::new(User::new(hash)))
            })
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    pub async fn add_password(&self, password: &str) {
        let hash = sha224_hex(password);
        self.users
            .write()
            .await
            .insert(hash.clone(), Arc::new(User::new(hash)));
    }

    pub async fn remove_hash(&self, hash: &str) -> bool {
        self.users.write().await.remove(hash).is_some()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn auth_user(&self, hash: &str) -> Option<Arc<User>> {
        let users = self.users.read().await;
        if let Some(user) = users.get(hash) {
            return Some(user.clone());
        }
        // Peers may send uppercase hex; identities are stored lowercase.
        if hash.bytes().any(|b| b.is_ascii_uppercase()) {
            return users.get(hash.to_ascii_lowercase().as_str()).cloned();
        }
        None
    }

    async fn users(&self) -> Vec<Arc<User>> {
        self.users.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_password_authenticates() {
        let auth = MemoryAuthenticator::from_passwords(["hunter2"]);
        let hash = sha224_hex("hunter2");
        let user = auth.auth_user(&hash).await.expect("registered user");
        assert_eq!(user.hash(), hash);
        assert!(auth.auth_user(&sha224_hex("wrong")).await.is_none());
    }

    #[tokio::test]
    async fn uppercase_hash_matches() {
        let auth = MemoryAuthenticator::from_passwords(["hunter2"]);
        let upper = sha224_hex("hunter2").to_ascii_uppercase();
        assert!(auth.auth_user(&upper).await.is_some());
    }

    #[tokio::test]
    async fn traffic_accumulates_and_drains() {
        let auth = MemoryAuthenticator::from_passwords(["p"]);
        let user = auth.auth_user(&sha224_hex("p")).await.unwrap();
        user.add_traffic(100, 50);
        user.add_traffic(1, 2);
        assert_eq!(user.traffic(), (101, 52));
        assert_eq!(user.take_traffic(), (101, 52));
        assert_eq!(user.traffic(), (0, 0));
    }

    #[tokio::test]
    async fn add_and_remove() {
        let auth = MemoryAuthenticator::new();
        assert!(auth.is_empty().await);
        auth.add_password("p").await;
        assert_eq!(auth.len().await, 1);
        assert!(auth.remove_hash(&sha224_hex("p")).await);
        assert!(auth.is_empty().await);
    }
}
