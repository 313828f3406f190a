use barter_session::SessionError;
use stomp_codec::StompError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// `send` was called while the channel is not `Connected`.
    #[error("realtime channel is not connected")]
    ChannelNotConnected,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The broker answered with an `ERROR` frame.
    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error(transparent)]
    Stomp(#[from] StompError),

    #[error("credential unavailable: {0}")]
    Credential(#[from] SessionError),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl ChannelError {
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}
