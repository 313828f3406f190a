use std::time::Duration;

use url::Url;

use crate::error::{ChannelError, Result};

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the STOMP broker.
    pub url: String,

    /// Fixed delay between a failure and the next connection attempt.
    pub reconnect_delay: Duration,

    /// Interval at which we promise to send heart-beats. Zero disables them.
    pub heartbeat_outgoing: Duration,

    /// Interval at which we want the broker's heart-beats. Zero disables them.
    pub heartbeat_incoming: Duration,

    /// Capacity of the state-change broadcast channel.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_owned(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: Duration::from_secs(4),
            heartbeat_incoming: Duration::from_secs(4),
            event_capacity: 64,
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("BARTER_WS_URL") {
            config.url = url;
        }
        if let Some(delay) = lookup("BARTER_RECONNECT_DELAY_MS") {
            let millis: u64 = delay.parse().map_err(|_| {
                ChannelError::Configuration(format!(
                    "BARTER_RECONNECT_DELAY_MS must be an integer, got `{delay}`"
                ))
            })?;
            config.reconnect_delay = Duration::from_millis(millis);
        }
        config.host()?;
        Ok(config)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeats(mut self, outgoing: Duration, incoming: Duration) -> Self {
        self.heartbeat_outgoing = outgoing;
        self.heartbeat_incoming = incoming;
        self
    }

    /// Value of the STOMP `host` header: the host part of the endpoint URL.
    pub fn host(&self) -> Result<String> {
        let url = Url::parse(&self.url)
            .map_err(|e| ChannelError::Configuration(format!("invalid url `{}`: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::Configuration(format!(
                "unsupported scheme `{}`, expected ws or wss",
                url.scheme()
            )));
        }
        url.host_str()
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::Configuration(format!("url `{}` has no host", self.url)))
    }
}
