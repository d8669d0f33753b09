//! In-memory bearer token cache.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::UserId;

/// User → bearer token map.
///
/// Entries never expire: the backing service account is durable cluster
/// state, so a token stays valid until the process exits.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<UserId, String>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: UserId) -> Option<String> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    pub fn insert(&self, user_id: UserId, token: String) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, token);
    }

    pub fn remove(&self, user_id: UserId) -> Option<String> {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id)
    }

    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = TokenCache::new();
        assert!(cache.get(1).is_none());

        cache.insert(1, "tok-1".into());
        assert_eq!(cache.get(1).as_deref(), Some("tok-1"));
        assert!(cache.get(2).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_forgets_token() {
        let cache = TokenCache::new();
        cache.insert(1, "tok-1".into());
        assert_eq!(cache.remove(1).as_deref(), Some("tok-1"));
        assert!(cache.is_empty());
    }
}
