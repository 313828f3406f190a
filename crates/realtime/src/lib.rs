//! Realtime messaging channel for the barter client.
//!
//! [`RealtimeChannel`] keeps one STOMP session open over WebSocket, replays
//! its subscriptions after every reconnect and dispatches inbound messages to
//! per-topic handlers. Authentication reuses the access token held by the
//! session's [`barter_session::CredentialStore`].
//!
//! ```no_run
//! # async fn demo(session: barter_session::Session) -> Result<(), barter_realtime::ChannelError> {
//! use barter_realtime::{ChannelConfig, RealtimeChannel};
//!
//! let channel = RealtimeChannel::websocket(ChannelConfig::from_env()?, session.store())?;
//! let _room = channel.subscribe("/topic/directRoom/7", |msg| {
//!     println!("{}", msg.text().unwrap_or_default());
//! });
//! channel.connect();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod heartbeat;
pub mod state;
pub mod subscription;

pub use channel::RealtimeChannel;
pub use config::{ChannelConfig, DEFAULT_WS_URL};
pub use connector::{ChannelConnector, ChannelLink, WebSocketConnector};
pub use error::{ChannelError, Result};
pub use heartbeat::Heartbeat;
pub use state::{ChannelState, StateChange};
pub use subscription::{InboundMessage, MessageHandler, SubscriptionHandle};
