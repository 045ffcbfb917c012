//! Types d'erreurs pour cdzqueue

/// Erreurs de gestion de file de lecture
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Durable write failed for queue {0}: {1}")]
    StorageWriteFailed(String, String),

    #[error("Index out of bound {0} >= {1}")]
    IndexOutOfRange(usize, usize),

    #[error("Durable write task aborted: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type Result spécialisé pour cdzqueue
pub type Result<T> = std::result::Result<T, Error>;
