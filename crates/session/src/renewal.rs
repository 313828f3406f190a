//! Single-flight credential renewal.
//!
//! However many requests hit a 401 at the same time, at most one call to the
//! renewal endpoint is in flight. Every caller (the one that started the
//! renewal included) joins a FIFO wait queue and receives the same outcome.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::credential::Credential;
use crate::error::{Result, SessionError};
use crate::http::{ApiRequest, HttpTransport, ReqwestTransport};
use crate::store::CredentialStore;

const SESSION_EVENT_CAPACITY: usize = 16;

/// Exchanges a refresh token for a new credential.
///
/// Implementations must not go through the request pipeline: a 401 from the
/// renewal endpoint is final.
#[async_trait]
pub trait RenewalClient: Send + Sync {
    async fn renew(&self, refresh_token: &str) -> Result<Credential>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Calls `POST {prefix}/auth/refresh` over its own HTTP client.
pub struct HttpRenewalClient {
    transport: Arc<dyn HttpTransport>,
    path: String,
}

impl HttpRenewalClient {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Ok(Self::with_transport(
            Arc::new(ReqwestTransport::new(config)?),
            config.refresh_path(),
        ))
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RenewalClient for HttpRenewalClient {
    async fn renew(&self, refresh_token: &str) -> Result<Credential> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })?;
        let request = ApiRequest::post(self.path.as_str()).json(body);
        let response = self.transport.execute(&request, None).await?;

        if response.is_unauthorized() {
            return Err(SessionError::auth_invalid("refresh token rejected"));
        }
        let credential: Credential = response.into_data()?;
        Ok(credential.with_claims_fallback())
    }
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The renewal endpoint refused the refresh token, or no token was stored.
    RenewalFailed(String),
    SignedOut,
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEndReason::RenewalFailed(reason) => write!(f, "renewal failed: {reason}"),
            SessionEndReason::SignedOut => f.write_str("signed out"),
        }
    }
}

/// Broadcast when the credential store is emptied and the user must sign in again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    pub reason: SessionEndReason,
    pub at: DateTime<Utc>,
}

type Waiter = oneshot::Sender<Result<Credential>>;

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    /// Bumped on every start and every cancellation; stale tasks compare against it.
    epoch: u64,
    waiters: VecDeque<Waiter>,
}

struct RenewalInner {
    store: Arc<CredentialStore>,
    client: Arc<dyn RenewalClient>,
    expired_tx: broadcast::Sender<SessionExpired>,
    state: Mutex<RenewalState>,
}

/// Guarantees at most one outstanding renewal.
///
/// Cheap to clone; clones share the same in-flight state.
#[derive(Clone)]
pub struct RenewalCoordinator {
    inner: Arc<RenewalInner>,
}

impl RenewalCoordinator {
    pub fn new(store: Arc<CredentialStore>, client: Arc<dyn RenewalClient>) -> Self {
        let (expired_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(RenewalInner {
                store,
                client,
                expired_tx,
                state: Mutex::new(RenewalState::default()),
            }),
        }
    }

    /// Obtain a fresh credential, joining the renewal already in flight if any.
    ///
    /// The renewal itself runs on a spawned task, so dropping this future
    /// neither cancels the renewal nor strands the other waiters.
    /// Waiters are settled in arrival order.
    ///
    /// # Returns
    /// * `Ok(credential)` - Renewed and persisted
    /// * `Err(AuthInvalid)` - Refresh token missing or rejected; the store was cleared
    /// * `Err(StorageFailure)` - Renewed, but the new credential could not be persisted
    #[instrument(skip(self))]
    pub async fn renew(&self) -> Result<Credential> {
        let (tx, rx) = oneshot::channel();

        let started = {
            let mut state = self.inner.state.lock();
            state.waiters.push_back(tx);
            if state.in_flight {
                debug!(waiters = state.waiters.len(), "Joining renewal in flight");
                None
            } else {
                state.in_flight = true;
                state.epoch += 1;
                Some(state.epoch)
            }
        };

        if let Some(epoch) = started {
            debug!(epoch, "Starting credential renewal");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(epoch).await });
        }

        rx.await
            .unwrap_or_else(|_| Err(SessionError::auth_invalid("renewal abandoned")))
    }

    /// Detach the renewal in flight, rejecting its waiters.
    ///
    /// The detached run finishes in the background but neither writes nor
    /// clears the store. Used by sign-out. Returns the number of rejected
    /// waiters.
    pub fn cancel(&self) -> usize {
        let waiters = {
            let mut state = self.inner.state.lock();
            if !state.in_flight {
                return 0;
            }
            state.epoch += 1;
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(SessionError::auth_invalid("signed out")));
        }
        info!(waiters = count, "Cancelled renewal in flight");
        count
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionExpired> {
        self.inner.expired_tx.subscribe()
    }

    /// Broadcast a session end to every subscriber.
    pub fn notify_session_end(&self, reason: SessionEndReason) {
        self.inner.notify(reason);
    }
}

impl RenewalInner {
    async fn run(self: Arc<Self>, epoch: u64) {
        let outcome = self.perform(epoch).await;

        let waiters = {
            let mut state = self.state.lock();
            if !state.in_flight || state.epoch != epoch {
                debug!(epoch, "Renewal was cancelled, dropping its outcome");
                return;
            }
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Renewal settled");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if let Err(SessionError::AuthInvalid { reason }) = &outcome {
            self.notify(SessionEndReason::RenewalFailed(reason.clone()));
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.in_flight && state.epoch == epoch
    }

    async fn perform(&self, epoch: u64) -> Result<Credential> {
        let store_epoch = self.store.clear_epoch();
        let refresh_token = match self.store.refresh_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return self.fail(epoch, "no refresh token stored".to_string()).await,
            Err(e) => return self.fail(epoch, format!("refresh token unreadable: {e}")).await,
        };

        let credential = match self.client.renew(&refresh_token).await {
            Ok(credential) => credential,
            Err(e) => return self.fail(epoch, e.to_string()).await,
        };

        if !self.is_current(epoch) {
            return Err(SessionError::auth_invalid("renewal cancelled"));
        }
        // A sign-out between here and the write bumps the store's clear epoch.
        if !self
            .store
            .write_unless_cleared(credential.clone(), store_epoch)
            .await?
        {
            return Err(SessionError::auth_invalid("signed out during renewal"));
        }
        info!("Credential renewed");
        Ok(credential)
    }

    async fn fail(&self, epoch: u64, reason: String) -> Result<Credential> {
        if self.is_current(epoch) {
            warn!(%reason, "Credential renewal failed, clearing session");
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Failed to clear credential store after renewal failure");
            }
        }
        Err(SessionError::AuthInvalid { reason })
    }

    fn notify(&self, reason: SessionEndReason) {
        let event = SessionExpired {
            reason,
            at: Utc::now(),
        };
        // No receivers is fine.
        let _ = self.expired_tx.send(event);
    }
}
