// MIT License

use crate::correlator::CommandTarget;

/// All errors that can occur in the telenot-gms library.
#[derive(Debug, thiserror::Error)]
pub enum GmsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("A command is already pending for {target}")]
    Busy { target: CommandTarget },

    #[error("No acknowledgement within {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    #[error("Session disconnected")]
    Disconnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid area index: {area} (max: {max})")]
    InvalidArea { area: u8, max: u8 },
}

impl GmsError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GmsError::Io(_)
                | GmsError::ConnectTimeout
                | GmsError::TimedOut { .. }
                | GmsError::Disconnected
                | GmsError::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, GmsError>;
