//! Reconnecting STOMP channel.
//!
//! ```text
//! Disconnected --connect()--> Connecting --CONNECTED--> Connected
//!                                  |                        |
//!                           failure|                   drop |
//!                                  v                        v
//!                               Errored <-------------------+
//!                                  | reconnect delay
//!                                  +--------> Connecting
//! any state --disconnect()--> Disconnected
//! ```
//!
//! A single driver task owns the link. Public operations only touch the
//! shared [`ChannelCore`] under a short synchronous lock and hand packets to
//! the driver through an unbounded queue.

use std::sync::Arc;

use barter_session::CredentialStore;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use stomp_codec::{Command, Frame, Packet};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ChannelConfig;
use crate::connector::{ChannelConnector, ChannelLink, WebSocketConnector};
use crate::error::{ChannelError, Result};
use crate::heartbeat::Heartbeat;
use crate::state::{ChannelState, StateChange};
use crate::subscription::{InboundMessage, MessageHandler, SubscriptionEntry, SubscriptionHandle};

const STOMP_VERSION: &str = "1.2";
const JSON_CONTENT_TYPE: &str = "application/json";

struct ChannelCore {
    state: ChannelState,
    /// Insertion-ordered; replayed on every successful connect.
    subscriptions: Vec<SubscriptionEntry>,
    /// Queue into the live link. Present from the resubscribe step until the link ends.
    outbound: Option<mpsc::UnboundedSender<Packet>>,
    cancel: Option<CancellationToken>,
    /// Driver task of the current generation.
    driver: Option<JoinHandle<()>>,
    /// Bumped by every `connect()`/`disconnect()`; older drivers stop mutating state.
    generation: u64,
    next_subscription_id: u64,
    next_registration: u64,
}

pub(crate) struct ChannelInner {
    config: ChannelConfig,
    host: String,
    connector: Arc<dyn ChannelConnector>,
    store: Arc<CredentialStore>,
    core: Mutex<ChannelCore>,
    events: broadcast::Sender<StateChange>,
}

/// How one connection attempt ended.
enum LinkEnd {
    Cancelled,
    Failed(ChannelError),
}

/// Persistent publish/subscribe channel with automatic reconnection.
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn ChannelConnector>,
        store: Arc<CredentialStore>,
    ) -> Result<Self> {
        let host = config.host()?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                host,
                connector,
                store,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Disconnected,
                    subscriptions: Vec::new(),
                    outbound: None,
                    cancel: None,
                    driver: None,
                    generation: 0,
                    next_subscription_id: 0,
                    next_registration: 0,
                }),
                events,
            }),
        })
    }

    /// Channel over tokio-tungstenite, connecting to `config.url`.
    pub fn websocket(config: ChannelConfig, store: Arc<CredentialStore>) -> Result<Self> {
        let connector = Arc::new(WebSocketConnector::new(config.url.clone()));
        Self::new(config, connector, store)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    /// Receive every state transition from now on.
    pub fn events(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// Start connecting. Only acts when `Disconnected`.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(url = %self.inner.config.url))]
    pub fn connect(&self) {
        let (generation, cancel) = {
            let mut core = self.inner.core.lock();
            if core.state != ChannelState::Disconnected {
                debug!(state = %core.state, "connect() ignored");
                return;
            }
            core.generation += 1;
            let cancel = CancellationToken::new();
            core.cancel = Some(cancel.clone());
            self.inner
                .set_state(&mut core, ChannelState::Connecting, None);
            (core.generation, cancel)
        };

        let inner = Arc::clone(&self.inner);
        let driver = tokio::spawn(async move { inner.drive(generation, cancel).await });
        let mut core = self.inner.core.lock();
        if core.generation == generation {
            core.driver = Some(driver);
        }
    }

    /// Close the link and stop reconnecting. No-op when already `Disconnected`.
    ///
    /// The subscription table is kept and replayed on the next `connect()`.
    /// Frames already accepted by [`send`](Self::send) are flushed first.
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        let mut core = self.inner.core.lock();
        if core.state == ChannelState::Disconnected {
            return;
        }
        core.generation += 1;
        if let Some(cancel) = core.cancel.take() {
            cancel.cancel();
        }
        self.inner
            .set_state(&mut core, ChannelState::Disconnected, None);
        info!("Realtime channel disconnected");
    }

    /// [`disconnect`](Self::disconnect), then wait until the driver has
    /// flushed queued frames and closed the link.
    pub async fn shutdown(&self) {
        let driver = self.inner.core.lock().driver.take();
        self.disconnect();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "Channel driver ended abnormally");
            }
        }
    }

    /// Register `handler` for `topic`.
    ///
    /// Subscribes on the wire right away when connected, otherwise on the next
    /// successful connect. Subscribing to a topic again replaces its handler
    /// in place; the earlier handle then no longer owns the subscription.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let handler: MessageHandler = Arc::new(handler);

        let mut replaced = None;
        let mut core = self.inner.core.lock();
        core.next_registration += 1;
        let registration = core.next_registration;

        let existing = core.subscriptions.iter().position(|e| e.topic == topic);
        let id = match existing {
            Some(index) => {
                let entry = &mut core.subscriptions[index];
                replaced = Some(std::mem::replace(&mut entry.handler, handler));
                entry.registration = registration;
                debug!(%topic, id = %entry.id, "Replaced subscription handler");
                entry.id.clone()
            }
            None => {
                let id = format!("sub-{}", core.next_subscription_id);
                core.next_subscription_id += 1;
                core.subscriptions.push(SubscriptionEntry {
                    id: id.clone(),
                    topic: topic.clone(),
                    registration,
                    handler,
                });
                match &core.outbound {
                    Some(outbound) => {
                        let _ = outbound.send(Frame::subscribe(&id, &topic).into());
                        debug!(%topic, %id, "Subscribed");
                    }
                    None => debug!(%topic, %id, "Subscription deferred until connected"),
                }
                id
            }
        };
        // The old handler may own handles whose drop takes the lock.
        drop(core);
        drop(replaced);

        SubscriptionHandle::new(Arc::downgrade(&self.inner), topic, id, registration)
    }

    /// Topics in the subscription table, in insertion order.
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .core
            .lock()
            .subscriptions
            .iter()
            .map(|e| e.topic.clone())
            .collect()
    }

    /// Publish a JSON payload to `destination`.
    ///
    /// Fails with [`ChannelError::ChannelNotConnected`] unless `Connected`;
    /// nothing is queued for later. A frame accepted here is written before
    /// the DISCONNECT of a later `disconnect()`, but delivery to the broker is
    /// not confirmed.
    pub fn send<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(payload)?);
        let core = self.inner.core.lock();
        if core.state != ChannelState::Connected {
            return Err(ChannelError::ChannelNotConnected);
        }
        let outbound = core.outbound.as_ref().ok_or(ChannelError::ChannelNotConnected)?;
        outbound
            .send(Frame::send(destination, JSON_CONTENT_TYPE, body).into())
            .map_err(|_| ChannelError::ChannelNotConnected)?;
        trace!(%destination, "Queued SEND frame");
        Ok(())
    }
}

impl ChannelInner {
    /// Must be called with the core lock held.
    fn set_state(&self, core: &mut ChannelCore, to: ChannelState, reason: Option<String>) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        if to != ChannelState::Connected {
            core.outbound = None;
        }
        debug!(%from, %to, reason = reason.as_deref(), "Channel state changed");
        // No receivers is fine.
        let _ = self.events.send(StateChange { from, to, reason });
    }

    /// Transition on behalf of the driver of `generation`. Returns `false` when
    /// that driver has been superseded and must stop.
    fn transition(&self, generation: u64, to: ChannelState, reason: Option<String>) -> bool {
        let mut core = self.core.lock();
        if core.generation != generation {
            return false;
        }
        self.set_state(&mut core, to, reason);
        true
    }

    pub(crate) fn remove_subscription(&self, topic: &str, registration: u64) -> bool {
        let mut core = self.core.lock();
        let Some(index) = core
            .subscriptions
            .iter()
            .position(|e| e.topic == topic && e.registration == registration)
        else {
            return false;
        };
        let entry = core.subscriptions.remove(index);
        if let Some(outbound) = &core.outbound {
            let _ = outbound.send(Frame::unsubscribe(&entry.id).into());
        }
        drop(core);
        debug!(%topic, id = %entry.id, "Unsubscribed");
        // Dropped unlocked: the handler may own other handles.
        drop(entry);
        true
    }

    async fn drive(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        loop {
            let error = match self.run_link(generation, &cancel).await {
                LinkEnd::Cancelled => break,
                LinkEnd::Failed(error) => error,
            };
            warn!(error = %error, delay = ?self.config.reconnect_delay, "Realtime link failed, reconnecting");
            if !self.transition(generation, ChannelState::Errored, Some(error.to_string())) {
                break;
            }

            if cancel
                .run_until_cancelled(tokio::time::sleep(self.config.reconnect_delay))
                .await
                .is_none()
            {
                break;
            }
            if !self.transition(generation, ChannelState::Connecting, None) {
                break;
            }
        }
        debug!(generation, "Channel driver stopped");
    }

    /// One connection attempt, from opening the link until it ends.
    async fn run_link(&self, generation: u64, cancel: &CancellationToken) -> LinkEnd {
        let token = match self.store.access_token().await {
            Ok(token) => token,
            Err(e) => return LinkEnd::Failed(e.into()),
        };

        let opened = cancel
            .run_until_cancelled(self.connector.connect(token.as_deref()))
            .await;
        let mut link = match opened {
            None => return LinkEnd::Cancelled,
            Some(Err(e)) => return LinkEnd::Failed(e),
            Some(Ok(link)) => link,
        };

        let handshake = cancel
            .run_until_cancelled(self.handshake(link.as_mut(), token.as_deref()))
            .await;
        let heartbeat = match handshake {
            None => {
                link.close().await;
                return LinkEnd::Cancelled;
            }
            Some(Err(e)) => {
                link.close().await;
                return LinkEnd::Failed(e);
            }
            Some(Ok(heartbeat)) => heartbeat,
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let replay = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return LinkEnd::Cancelled;
            }
            core.outbound = Some(outbound_tx);
            core.subscriptions
                .iter()
                .map(|e| Frame::subscribe(&e.id, &e.topic))
                .collect::<Vec<_>>()
        };

        let replayed = replay.len();
        for frame in replay {
            if let Err(e) = link.send_packet(frame.into()).await {
                return LinkEnd::Failed(e);
            }
        }
        if !self.transition(generation, ChannelState::Connected, None) {
            link.close().await;
            return LinkEnd::Cancelled;
        }
        info!(subscriptions = replayed, "Realtime channel connected");

        self.pump(link, outbound_rx, heartbeat, cancel).await
    }

    /// Send CONNECT and wait for CONNECTED.
    async fn handshake(&self, link: &mut dyn ChannelLink, token: Option<&str>) -> Result<Heartbeat> {
        let mut connect = Frame::connect(&self.host, STOMP_VERSION).header(
            "heart-beat",
            Heartbeat::client_header(self.config.heartbeat_outgoing, self.config.heartbeat_incoming),
        );
        if let Some(token) = token {
            connect = connect.header("Authorization", format!("Bearer {token}"));
        }
        link.send_packet(connect.into()).await?;

        loop {
            match link.next_packet().await {
                Some(Ok(Packet::Frame(frame))) => match frame.command {
                    Command::Connected => {
                        return Ok(Heartbeat::negotiate(
                            self.config.heartbeat_outgoing,
                            self.config.heartbeat_incoming,
                            frame.get_header("heart-beat"),
                        ));
                    }
                    Command::Error => return Err(ChannelError::Rejected(error_text(&frame))),
                    other => {
                        return Err(ChannelError::protocol(format!(
                            "expected CONNECTED, got {other}"
                        )));
                    }
                },
                Some(Ok(Packet::Heartbeat)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(ChannelError::transport("link closed during handshake")),
            }
        }
    }

    /// Shuttle packets until the link fails or the driver is cancelled.
    async fn pump(
        &self,
        mut link: Box<dyn ChannelLink>,
        mut outbound: mpsc::UnboundedReceiver<Packet>,
        heartbeat: Heartbeat,
        cancel: &CancellationToken,
    ) -> LinkEnd {
        let mut send_timer = heartbeat.send_every.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut last_seen = Instant::now();

        loop {
            let silence_deadline = heartbeat.expect_every.map(|period| last_seen + period * 2);

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Frames queued before `disconnect()` still go out ahead of DISCONNECT.
                    let mut flushed = 0usize;
                    while let Ok(packet) = outbound.try_recv() {
                        if link.send_packet(packet).await.is_err() {
                            break;
                        }
                        flushed += 1;
                    }
                    if flushed > 0 {
                        debug!(flushed, "Flushed queued frames before disconnecting");
                    }
                    let _ = link.send_packet(Frame::disconnect().into()).await;
                    link.close().await;
                    return LinkEnd::Cancelled;
                }

                Some(packet) = outbound.recv() => {
                    if let Err(e) = link.send_packet(packet).await {
                        return LinkEnd::Failed(e);
                    }
                }

                _ = tick(&mut send_timer) => {
                    if let Err(e) = link.send_packet(Packet::Heartbeat).await {
                        return LinkEnd::Failed(e);
                    }
                    trace!("Sent heart-beat");
                }

                _ = sleep_until(silence_deadline) => {
                    return LinkEnd::Failed(ChannelError::transport("broker heart-beat timed out"));
                }

                incoming = link.next_packet() => match incoming {
                    Some(Ok(packet)) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.handle_inbound(packet) {
                            return LinkEnd::Failed(e);
                        }
                    }
                    Some(Err(e)) => return LinkEnd::Failed(e),
                    None => return LinkEnd::Failed(ChannelError::transport("link closed by peer")),
                },
            }
        }
    }

    fn handle_inbound(&self, packet: Packet) -> Result<()> {
        let frame = match packet {
            Packet::Heartbeat => return Ok(()),
            Packet::Frame(frame) => frame,
        };
        match frame.command {
            Command::Message => {
                self.dispatch(InboundMessage::from_frame(frame));
                Ok(())
            }
            Command::Error => Err(ChannelError::Rejected(error_text(&frame))),
            Command::Receipt => {
                trace!(receipt = frame.get_header("receipt-id"), "Receipt");
                Ok(())
            }
            other => {
                debug!(command = %other, "Ignoring unexpected frame");
                Ok(())
            }
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        let handler = {
            let core = self.core.lock();
            core.subscriptions
                .iter()
                .find(|e| e.topic == message.topic)
                .or_else(|| {
                    let id = message.subscription_id.as_deref()?;
                    core.subscriptions.iter().find(|e| e.id == id)
                })
                .map(|e| Arc::clone(&e.handler))
        };

        match handler {
            Some(handler) => handler(message),
            None => warn!(
                topic = %message.topic,
                subscription = message.subscription_id.as_deref(),
                "Dropping message for unmatched topic"
            ),
        }
    }
}

fn error_text(frame: &Frame) -> String {
    match frame.get_header("message") {
        Some(message) => message.to_owned(),
        None => String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
