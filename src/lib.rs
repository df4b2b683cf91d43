use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmbedqError>;

#[derive(Error, Debug)]
pub enum EmbedqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Content fetch error: {0}")]
    ContentFetch(String),

    #[error("Embedding provider error: {0}")]
    Provider(#[from] crate::embeddings::client::ProviderError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod config;
pub mod database;
pub mod embeddings;
pub mod maintenance;
pub mod metrics;
pub mod pool;
pub mod worker;
