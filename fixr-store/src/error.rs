use thiserror::Error;

/// Failures bringing the storage layer up. Runtime query failures surface as
/// `EngineError::Storage` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
