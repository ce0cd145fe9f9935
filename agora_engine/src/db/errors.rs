use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database driver error: {0}")]
    DriverError(#[from] sqlx::Error),
    #[error("Could not run database migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("Stored data could not be converted: {0}")]
    DataConversion(String),
    #[error("Attempted to write inside a read-only transaction")]
    ReadOnly,
    #[error("Transaction function panicked: {0}")]
    Panicked(String),
    #[error("Public data error: {0}")]
    PublicData(String),
    #[error("Unknown savepoint {0}")]
    UnknownSavepoint(usize),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::PublicData(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataConversion(e.to_string())
    }
}
