//! Session facade wiring store, renewal coordinator and pipeline together.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::auth::{AuthApi, SignInRequest, SignUpRequest};
use crate::config::SessionConfig;
use crate::credential::Credential;
use crate::error::Result;
use crate::http::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
use crate::pipeline::RequestPipeline;
use crate::renewal::{
    HttpRenewalClient, RenewalClient, RenewalCoordinator, SessionEndReason, SessionExpired,
};
use crate::storage::{FileStorage, MemoryStorage, SecureStorage};
use crate::store::CredentialStore;

/// Owns one credential store, one renewal coordinator and the pipeline on top.
///
/// Construct one per signed-in user and share it behind an `Arc`.
pub struct Session {
    config: SessionConfig,
    store: Arc<CredentialStore>,
    renewal: RenewalCoordinator,
    pipeline: RequestPipeline,
    transport: Arc<dyn HttpTransport>,
}

impl Session {
    /// Build a session backed by reqwest and the configured storage.
    ///
    /// The renewal client gets its own HTTP client, separate from the pipeline's.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let storage: Arc<dyn SecureStorage> = match &config.storage_path {
            Some(path) => Arc::new(FileStorage::new(path)),
            None => Arc::new(MemoryStorage::new()),
        };
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        let renewal_client = Arc::new(HttpRenewalClient::new(&config)?);
        Ok(Self::from_parts(config, storage, transport, renewal_client))
    }

    /// Build a session from explicit collaborators.
    pub fn from_parts(
        config: SessionConfig,
        storage: Arc<dyn SecureStorage>,
        transport: Arc<dyn HttpTransport>,
        renewal_client: Arc<dyn RenewalClient>,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        let renewal = RenewalCoordinator::new(Arc::clone(&store), renewal_client);
        let pipeline = RequestPipeline::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            renewal.clone(),
            config.refresh_path(),
        );
        Self {
            config,
            store,
            renewal,
            pipeline,
            transport,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> Arc<CredentialStore> {
        Arc::clone(&self.store)
    }

    pub fn renewal(&self) -> &RenewalCoordinator {
        &self.renewal
    }

    /// Load any persisted credential. Returns whether the user is signed in.
    pub async fn restore(&self) -> Result<bool> {
        self.store.warm().await
    }

    pub async fn issue_request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.pipeline.issue_request(request).await
    }

    pub async fn credential(&self) -> Result<Option<Credential>> {
        self.store.read().await
    }

    pub async fn is_signed_in(&self) -> Result<bool> {
        Ok(self.store.read().await?.is_some())
    }

    /// Subscribe to session-end notifications (renewal failure or sign-out).
    pub fn on_session_expired(&self) -> broadcast::Receiver<SessionExpired> {
        self.renewal.subscribe()
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Credential> {
        let request = SignInRequest {
            email: email.to_owned(),
            password: password.to_owned(),
        };
        let credential = AuthApi::new(self.transport.as_ref(), &self.config)
            .sign_in(&request)
            .await?;
        self.store.write(credential.clone()).await?;
        Ok(credential)
    }

    /// Create an account, then sign in with it.
    #[instrument(skip(self, password))]
    pub async fn sign_up(&self, email: &str, password: &str, nickname: &str) -> Result<Credential> {
        let request = SignUpRequest {
            email: email.to_owned(),
            password: password.to_owned(),
            nickname: nickname.to_owned(),
        };
        AuthApi::new(self.transport.as_ref(), &self.config)
            .sign_up(&request)
            .await?;
        self.sign_in(email, password).await
    }

    /// End the session: cancel any renewal in flight, forget the credential,
    /// then tell the server.
    ///
    /// Waiters of a cancelled renewal get `AuthInvalid`. The realtime channel
    /// is not owned here; callers disconnect it themselves.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        let previous = self.store.read().await.ok().flatten();

        self.renewal.cancel();
        self.store.clear().await?;
        self.renewal.notify_session_end(SessionEndReason::SignedOut);
        info!("Signed out");

        if let Some(credential) = previous {
            AuthApi::new(self.transport.as_ref(), &self.config)
                .sign_out(&credential.access_token)
                .await;
        }
        Ok(())
    }
}
