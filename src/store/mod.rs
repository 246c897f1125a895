//! Store access for personal best recomputation.
//!
//! This module contains:
//! - `BestRecordUpdater` trait: the per-pair update transaction
//! - `StoreError` and storage configuration types
//! - Implementations: SQLite (sqlx)

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteRecordStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown storage type: {0}")]
    UnknownStorageType(String),
}

/// Recomputes and persists the best-record flag for one pair.
///
/// `update` runs inside a single atomic store transaction on a session owned
/// exclusively by the calling unit. It returns the ids of every record whose
/// `is_best` flag changed (cleared losers plus the new winner, if any), for
/// the caller to forward to the change notifier after commit. A second call
/// with no intervening record changes returns an empty set.
#[async_trait]
pub trait BestRecordUpdater: Send + Sync {
    /// Re-establish the single-winner invariant for the pair.
    async fn update(&self, participant_id: i64, level_id: i64) -> Result<Vec<i64>>;
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator (currently only "sqlite").
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Database path.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "data/pbproc.db".to_string(),
        }
    }
}

/// Initialize the record store based on configuration.
pub async fn init_store(config: &StorageConfig) -> Result<Arc<dyn BestRecordUpdater>> {
    info!(
        storage_type = %config.storage_type,
        path = %config.path,
        "Initializing store"
    );

    match config.storage_type.as_str() {
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let store = SqliteRecordStore::new(pool);
            store.init().await?;

            Ok(Arc::new(store))
        }
        other => Err(StoreError::UnknownStorageType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.storage_type, "sqlite");
        assert_eq!(config.path, "data/pbproc.db");
    }

    #[tokio::test]
    async fn test_init_store_rejects_unknown_type() {
        let config = StorageConfig {
            storage_type: "mongodb".to_string(),
            path: "unused".to_string(),
        };
        let err = init_store(&config).await.err().expect("should fail");
        assert!(matches!(err, StoreError::UnknownStorageType(_)));
    }
}
