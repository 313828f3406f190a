use std::fmt;

/// Connection state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// The last attempt failed or the link dropped; a reconnect is scheduled.
    Errored,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Errored => "errored",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition, broadcast to every `events()` receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ChannelState,
    pub to: ChannelState,
    /// Why the channel entered `Errored`.
    pub reason: Option<String>,
}
