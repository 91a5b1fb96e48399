use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::SorapoolError;

/// A partial update that knows how to apply itself to the store.
#[async_trait]
pub trait DbPatchable {
    async fn apply_patch(&self, job_id: i64, pool: &SqlitePool) -> Result<(), SorapoolError>;
}
