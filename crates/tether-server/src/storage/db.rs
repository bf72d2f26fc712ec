//! `SQLite` database for the Tether control plane.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

pub use tether_core::db::DatabaseError;
use tether_core::db::{open_pool, open_pool_in_memory};

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Database file at `path`, created and migrated as needed.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(open_pool(path).await?).await
    }

    /// Throwaway in-memory database with the full schema.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!("Control plane schema up to date");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
