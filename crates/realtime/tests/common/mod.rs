//! In-memory broker standing in for the WebSocket endpoint.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use barter_realtime::{
    ChannelConfig, ChannelConnector, ChannelError, ChannelLink, ChannelState, RealtimeChannel,
    Result, StateChange,
};
use barter_session::{Credential, CredentialStore, MemoryStorage};
use stomp_codec::{Command, Frame, Packet};
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(60);

/// Hands one [`Broker`] to the test per successful connection attempt.
pub struct MockConnector {
    links: mpsc::UnboundedSender<Broker>,
    refusals: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Broker>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            refusals: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, bearer: Option<&str>) -> Result<Box<dyn ChannelLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::connect("connection refused"));
        }

        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        self.links
            .send(Broker {
                bearer: bearer.map(str::to_owned),
                inbound: from_client,
                outbound: Some(to_client),
            })
            .map_err(|_| ChannelError::connect("broker gone"))?;

        Ok(Box::new(MockLink {
            to_broker: Some(to_broker),
            from_broker,
        }))
    }
}

struct MockLink {
    to_broker: Option<mpsc::UnboundedSender<Packet>>,
    from_broker: mpsc::UnboundedReceiver<Packet>,
}

#[async_trait]
impl ChannelLink for MockLink {
    async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        match &self.to_broker {
            Some(tx) => tx
                .send(packet)
                .map_err(|_| ChannelError::transport("broker hung up")),
            None => Err(ChannelError::transport("link closed")),
        }
    }

    async fn next_packet(&mut self) -> Option<Result<Packet>> {
        self.from_broker.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.to_broker = None;
    }
}

/// Broker side of one link.
pub struct Broker {
    /// Token the connector was given for the upgrade request.
    pub bearer: Option<String>,
    inbound: mpsc::UnboundedReceiver<Packet>,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
}

impl Broker {
    /// Next packet from the client, heart-beats included. `None` once closed.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for the client")
    }

    /// Next frame from the client, skipping heart-beats.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            match self.next_packet().await {
                Some(Packet::Frame(frame)) => return frame,
                Some(Packet::Heartbeat) => continue,
                None => panic!("client closed the link"),
            }
        }
    }

    /// Read CONNECT and answer CONNECTED with heart-beats disabled.
    pub async fn accept(&mut self) -> Frame {
        self.accept_with_heartbeat("0,0").await
    }

    pub async fn accept_with_heartbeat(&mut self, heart_beat: &str) -> Frame {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, Command::Connect);
        self.push(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heart_beat),
        );
        connect
    }

    pub fn push(&self, frame: Frame) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(frame.into());
        }
    }

    pub fn message(&self, topic: &str, subscription: &str, body: &str) {
        self.push(
            Frame::new(Command::Message)
                .header("destination", topic)
                .header("subscription", subscription)
                .header("message-id", "m-1")
                .body(body.to_owned()),
        );
    }

    /// Close the broker-to-client direction, as a dropped socket would.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }

    /// Frames already sent by the client, without waiting.
    pub fn pending_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(packet) = self.inbound.try_recv() {
            if let Packet::Frame(frame) = packet {
                frames.push(frame);
            }
        }
        frames
    }

    /// Every frame until the client closes its side.
    pub async fn drain_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(packet) = self.next_packet().await {
            if let Packet::Frame(frame) = packet {
                frames.push(frame);
            }
        }
        frames
    }
}

pub async fn next_broker(links: &mut mpsc::UnboundedReceiver<Broker>) -> Broker {
    tokio::time::timeout(WAIT, links.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub async fn next_change(events: &mut broadcast::Receiver<StateChange>) -> StateChange {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a state change")
        .expect("event stream closed")
}

/// Wait until the channel enters `state`, returning the states seen on the way.
pub async fn wait_for(
    events: &mut broadcast::Receiver<StateChange>,
    state: ChannelState,
) -> Vec<ChannelState> {
    let mut seen = Vec::new();
    loop {
        let change = next_change(events).await;
        seen.push(change.to);
        if change.to == state {
            return seen;
        }
    }
}

pub async fn signed_in_store(access_token: &str) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::new(Arc::new(MemoryStorage::new())));
    store
        .write(Credential::from_tokens(access_token, "refresh-1"))
        .await
        .unwrap();
    store
}

pub fn quiet_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_reconnect_delay(Duration::from_secs(1))
        .with_heartbeats(Duration::ZERO, Duration::ZERO)
}

pub struct Harness {
    pub channel: RealtimeChannel,
    pub connector: Arc<MockConnector>,
    pub links: mpsc::UnboundedReceiver<Broker>,
    pub events: broadcast::Receiver<StateChange>,
    pub store: Arc<CredentialStore>,
}

pub async fn harness(config: ChannelConfig) -> Harness {
    let (connector, links) = MockConnector::new();
    let store = signed_in_store("access-1").await;
    let channel = RealtimeChannel::new(config, connector.clone(), store.clone()).unwrap();
    let events = channel.events();
    Harness {
        channel,
        connector,
        links,
        events,
        store,
    }
}
