use thiserror::Error;

/// Errors surfaced by the fleet's library code.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding a network message failed
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {message}")]
    Config { message: String },

    /// The other end of an internal channel is gone
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl FleetError {
    pub fn config(message: impl Into<String>) -> Self {
        FleetError::Config {
            message: message.into(),
        }
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
