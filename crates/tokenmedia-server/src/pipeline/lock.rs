//! At-most-one in-flight run per token

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Lock TTL; matches the whole-job deadline with headroom for persistence
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock service error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait TokenLock: Send + Sync {
    /// Take the lock if nobody holds an unexpired claim; never waits.
    ///
    /// Returns the holder id to release with, or `None` on contention.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Uuid>, LockError>;

    /// Release a claim; a no-op when `holder` no longer owns it
    async fn release(&self, key: &str, holder: Uuid) -> Result<(), LockError>;
}

/// TTL rows in `token_processing_locks`
#[derive(Clone)]
pub struct PgTokenLock {
    pool: PgPool,
}

impl PgTokenLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenLock for PgTokenLock {
    #[instrument(skip(self))]
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Uuid>, LockError> {
        let holder = Uuid::new_v4();
        let acquired: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO token_processing_locks (key, holder, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE token_processing_locks.expires_at < now()
            RETURNING holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        debug!(acquired = acquired.is_some(), "Lock attempt");
        Ok(acquired.map(|(holder,)| holder))
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, holder: Uuid) -> Result<(), LockError> {
        sqlx::query("DELETE FROM token_processing_locks WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local lock for tests and single-node development
#[derive(Default)]
pub struct MemoryTokenLock {
    claims: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl MemoryTokenLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.claims
            .lock()
            .map(|claims| {
                claims
                    .get(key)
                    .is_some_and(|(_, expires)| *expires > Instant::now())
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl TokenLock for MemoryTokenLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Uuid>, LockError> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let now = Instant::now();
        if let Some((_, expires)) = claims.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let holder = Uuid::new_v4();
        claims.insert(key.to_string(), (holder, now + ttl));
        Ok(Some(holder))
    }

    async fn release(&self, key: &str, holder: Uuid) -> Result<(), LockError> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if claims.get(key).is_some_and(|(owner, _)| *owner == holder) {
            claims.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contention_and_release() {
        let lock = MemoryTokenLock::new();
        let holder = lock.try_acquire("k", DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        assert!(lock.try_acquire("k", DEFAULT_LOCK_TTL).await.unwrap().is_none());
        assert!(lock.try_acquire("other", DEFAULT_LOCK_TTL).await.unwrap().is_some());

        lock.release("k", Uuid::new_v4()).await.unwrap();
        assert!(lock.is_held("k"));

        lock.release("k", holder).await.unwrap();
        assert!(!lock.is_held("k"));
        assert!(lock.try_acquire("k", DEFAULT_LOCK_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_claim_is_taken_over() {
        let lock = MemoryTokenLock::new();
        lock.try_acquire("k", Duration::ZERO).await.unwrap().unwrap();
        assert!(lock.try_acquire("k", DEFAULT_LOCK_TTL).await.unwrap().is_some());
    }
}
