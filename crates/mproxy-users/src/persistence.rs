use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::user::User;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage seam for the user store. Used only at bootstrap (`load_all`) and by
/// the single flush writer; runtime reads come from the in-memory store.
#[async_trait]
pub trait UserPersistence: Send + Sync {
    async fn load_all(&self) -> PersistenceResult<Vec<User>>;
    /// Atomic batch write: either all rows land or the flush pass retries.
    async fn upsert_batch(&self, users: &[User]) -> PersistenceResult<()>;
    async fn delete_batch(&self, tokens: &[String]) -> PersistenceResult<()>;
}

/// Process-lifetime persistence for tests and keyless deployments.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: Mutex<Vec<User>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserPersistence for MemoryPersistence {
    async fn load_all(&self) -> PersistenceResult<Vec<User>> {
        Ok(self.rows.lock().await.clone())
    }

    async fn upsert_batch(&self, users: &[User]) -> PersistenceResult<()> {
        let mut rows = self.rows.lock().await;
        for user in users {
            match rows.iter_mut().find(|row| row.token == user.token) {
                Some(row) => *row = user.clone(),
                None => rows.push(user.clone()),
            }
        }
        Ok(())
    }

    async fn delete_batch(&self, tokens: &[String]) -> PersistenceResult<()> {
        let mut rows = self.rows.lock().await;
        rows.retain(|row| !tokens.contains(&row.token));
        Ok(())
    }
}
