//! Subscription table entries, handles and inbound messages.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use stomp_codec::Frame;

use crate::channel::ChannelInner;
use crate::error::{ChannelError, Result};

/// Callback invoked for every message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A MESSAGE frame delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub subscription_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InboundMessage {
    pub(crate) fn from_frame(frame: Frame) -> Self {
        let topic = frame.destination().unwrap_or_default().to_owned();
        let subscription_id = frame.get_header("subscription").map(str::to_owned);
        let message_id = frame.get_header("message-id").map(str::to_owned);
        Self {
            topic,
            subscription_id,
            message_id,
            headers: frame.headers,
            body: frame.body,
        }
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ChannelError::MalformedPayload(format!("body is not UTF-8: {e}")))
    }
}

pub(crate) struct SubscriptionEntry {
    /// Wire id sent in SUBSCRIBE/UNSUBSCRIBE frames.
    pub(crate) id: String,
    pub(crate) topic: String,
    /// Identifies the handle that currently owns this entry.
    pub(crate) registration: u64,
    pub(crate) handler: MessageHandler,
}

/// Owns one subscription. Dropping the handle unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    channel: Weak<ChannelInner>,
    topic: String,
    id: String,
    registration: u64,
}

impl SubscriptionHandle {
    pub(crate) fn new(channel: Weak<ChannelInner>, topic: String, id: String, registration: u64) -> Self {
        Self {
            channel,
            topic,
            id,
            registration,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wire id of the subscription.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the subscription, and unsubscribe on the wire if connected.
    ///
    /// Returns `false` when the entry was already gone or was taken over by a
    /// later `subscribe` on the same topic.
    pub fn unsubscribe(self) -> bool {
        self.release()
    }

    fn release(&self) -> bool {
        match self.channel.upgrade() {
            Some(channel) => channel.remove_subscription(&self.topic, self.registration),
            None => false,
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use stomp_codec::Command;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct ChatMessage {
        room_id: u64,
        content: String,
    }

    fn message(body: &'static str) -> InboundMessage {
        InboundMessage::from_frame(
            Frame::new(Command::Message)
                .header("destination", "/topic/directRoom/3")
                .header("subscription", "sub-0")
                .header("message-id", "m-1")
                .body(body),
        )
    }

    #[test]
    fn headers_are_lifted() {
        let msg = message("{}");
        assert_eq!(msg.topic, "/topic/directRoom/3");
        assert_eq!(msg.subscription_id.as_deref(), Some("sub-0"));
        assert_eq!(msg.message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn json_body_is_parsed() {
        let msg = message(r#"{"roomId":3,"content":"hi"}"#);
        assert_eq!(
            msg.json::<ChatMessage>().unwrap(),
            ChatMessage {
                room_id: 3,
                content: "hi".into()
            }
        );
    }

    #[test]
    fn bad_json_is_malformed_payload() {
        let msg = message("not json");
        assert!(matches!(
            msg.json::<ChatMessage>(),
            Err(ChannelError::MalformedPayload(_))
        ));
        assert_eq!(msg.text().unwrap(), "not json");
    }
}
