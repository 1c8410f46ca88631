//! Single-active-token-per-user registry
//!
//! Tokens are self-verifying, so the only way to revoke one before it expires
//! is to stop recognizing it here. Writing a new token for a user overwrites
//! the previous record, which implicitly revokes the old token.

use std::{fmt, time::Duration};

use tracing::{debug, warn};

use crate::{CacheError, CacheService, CacheValue, RedisStore, RemoteStore, keys};

/// Which token namespace a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Access => keys::ACCESS_TOKEN_PREFIX,
            Self::Refresh => keys::REFRESH_TOKEN_PREFIX,
        }
    }

    pub fn key(self, user_id: &str) -> String {
        format!("{}{}", self.prefix(), user_id)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Session token records stored through a [`CacheService`]
///
/// Unlike entity caches, this store is the source of truth: a missing record
/// means the session is gone.
pub struct SessionStore<S: RemoteStore = RedisStore> {
    cache: CacheService<S>,
}

impl<S: RemoteStore> Clone for SessionStore<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<S: RemoteStore> SessionStore<S> {
    pub fn new(cache: CacheService<S>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheService<S> {
        &self.cache
    }

    /// Record `token` as the only valid token of this kind for the user
    pub async fn set_token(
        &self,
        user_id: &str,
        kind: TokenKind,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let key = kind.key(user_id);
        debug!("Recording {} token for user {}", kind, user_id);
        self.cache
            .set(&key, &CacheValue::Token(token.to_owned()), Some(ttl))
            .await
    }

    pub async fn get_token(
        &self,
        user_id: &str,
        kind: TokenKind,
    ) -> Result<Option<String>, CacheError> {
        let key = kind.key(user_id);
        match self.cache.get(&key).await? {
            Some(CacheValue::Token(token)) => Ok(Some(token)),
            Some(other) => {
                warn!(
                    "Unexpected {} value under session key {}; ignoring",
                    other.kind(),
                    key
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Forget the recorded token; any copy still held by a client stops verifying
    pub async fn invalidate_token(&self, user_id: &str, kind: TokenKind) -> Result<bool, CacheError> {
        debug!("Invalidating {} token for user {}", kind, user_id);
        self.cache.delete(&kind.key(user_id)).await
    }

    /// Invalidate both the access and the refresh record
    pub async fn invalidate_all(&self, user_id: &str) -> Result<(), CacheError> {
        self.invalidate_token(user_id, TokenKind::Access).await?;
        self.invalidate_token(user_id, TokenKind::Refresh).await?;
        Ok(())
    }

    /// Exact match against the recorded token
    pub async fn matches(
        &self,
        user_id: &str,
        kind: TokenKind,
        presented: &str,
    ) -> Result<bool, CacheError> {
        Ok(self
            .get_token(user_id, kind)
            .await?
            .is_some_and(|recorded| recorded == presented))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheConfig, testing::MemoryStore};

    fn store(remote: &MemoryStore) -> SessionStore<MemoryStore> {
        SessionStore::new(CacheService::with_store(
            remote.clone(),
            CacheConfig::default(),
        ))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn newer_token_supersedes_older() {
        let sessions = store(&MemoryStore::ready());
        sessions.set_token("u1", TokenKind::Access, "t1", HOUR).await.unwrap();
        sessions.set_token("u1", TokenKind::Access, "t2", HOUR).await.unwrap();

        assert!(!sessions.matches("u1", TokenKind::Access, "t1").await.unwrap());
        assert!(sessions.matches("u1", TokenKind::Access, "t2").await.unwrap());
    }

    #[tokio::test]
    async fn invalidate_removes_record() {
        let remote = MemoryStore::ready();
        let sessions = store(&remote);
        sessions.set_token("u1", TokenKind::Access, "t1", HOUR).await.unwrap();
        assert_eq!(remote.ttl_of("token:u1"), Some(HOUR));

        sessions.invalidate_token("u1", TokenKind::Access).await.unwrap();
        assert_eq!(sessions.get_token("u1", TokenKind::Access).await.unwrap(), None);
        assert!(!sessions.matches("u1", TokenKind::Access, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn kinds_are_separate_namespaces() {
        let remote = MemoryStore::ready();
        let sessions = store(&remote);
        sessions.set_token("u1", TokenKind::Access, "a", HOUR).await.unwrap();
        sessions.set_token("u1", TokenKind::Refresh, "r", HOUR).await.unwrap();
        assert!(remote.raw("refresh:u1").is_some());

        sessions.invalidate_token("u1", TokenKind::Access).await.unwrap();
        assert!(sessions.matches("u1", TokenKind::Refresh, "r").await.unwrap());

        sessions.invalidate_all("u1").await.unwrap();
        assert_eq!(sessions.get_token("u1", TokenKind::Refresh).await.unwrap(), None);
    }

    #[tokio::test]
    async fn works_while_remote_is_down() {
        let remote = MemoryStore::default();
        let sessions = store(&remote);
        sessions.set_token("u1", TokenKind::Access, "t1", HOUR).await.unwrap();
        assert!(sessions.matches("u1", TokenKind::Access, "t1").await.unwrap());

        sessions.invalidate_token("u1", TokenKind::Access).await.unwrap();
        assert!(!sessions.matches("u1", TokenKind::Access, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn non_token_value_is_not_a_session() {
        let remote = MemoryStore::ready();
        let sessions = store(&remote);
        remote.put_raw("token:u1", r#"{"kind":"generation","data":"x"}"#);
        assert_eq!(sessions.get_token("u1", TokenKind::Access).await.unwrap(), None);
    }
}
