use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    /// An expected playlist entry could not be located. Logged as a severe
    /// anomaly; this is a never-should-happen condition.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("No active playlist selection")]
    NoSelection,

    #[error("Controller lane is closed")]
    LaneClosed,

    #[error("Backend migration did not drain within the bounded wait")]
    MigrationTimeout,

    #[error("Playlist store error: {0}")]
    PlaylistStore(String),

    #[error(transparent)]
    Player(#[from] cdzplayer::PlayerError),

    #[error(transparent)]
    Queue(#[from] cdzqueue::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
