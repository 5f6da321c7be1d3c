pub mod worker;

use crate::error::worker::{EnqueueError, RegistryError, WorkError};
use thiserror::Error;

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Tracing(#[from] tracing_subscriber::util::TryInitError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Vcs(#[from] crate::vcs::VcsError),

    #[error(transparent)]
    Ai(#[from] crate::ai::AiError),

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Processor(#[from] crate::worker::processor::ProcessorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
