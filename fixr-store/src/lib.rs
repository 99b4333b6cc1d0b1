pub mod app_config;
pub mod database;
pub mod error;
pub mod events;
pub mod memory;
pub mod pg_store;
pub mod redis_repo;

use std::sync::Arc;

use fixr_core::Store;
use tracing::info;

pub use app_config::{Config, StorageBackend};
pub use database::DbClient;
pub use error::StoreError;
pub use events::{EventBus, Subscription};
pub use memory::InMemoryStore;
pub use pg_store::PgStore;
pub use redis_repo::RedisClient;

/// Build the configured store, running migrations for Postgres.
pub async fn connect(config: &app_config::StorageConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let db = DbClient::new(config).await?;
            db.migrate().await?;
            info!("Connected to Postgres");
            Ok(Arc::new(PgStore::new(db.pool)))
        }
    }
}
