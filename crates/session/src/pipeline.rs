//! Authenticated request pipeline.
//!
//! Attaches the current access token to every request and transparently
//! recovers from an expired token: on a 401 the request is retried once,
//! after a single-flight renewal if no newer token is already stored.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::credential::Credential;
use crate::error::Result;
use crate::http::{ApiRequest, ApiResponse, HttpTransport};
use crate::renewal::RenewalCoordinator;
use crate::store::CredentialStore;

/// Outcome of one network attempt.
enum Attempt {
    Completed(ApiResponse),
    AuthExpired(ApiResponse),
}

pub struct RequestPipeline {
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    renewal: RenewalCoordinator,
    /// Requests to this path never trigger a renewal.
    renewal_path: String,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        renewal: RenewalCoordinator,
        renewal_path: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            renewal,
            renewal_path: renewal_path.into(),
        }
    }

    /// Send a request with the current access token.
    ///
    /// A 401 triggers at most one retry. Every other status, 401 on the retry
    /// included, is returned untouched; interpreting it is the caller's job.
    ///
    /// # Returns
    /// * `Ok(response)` - The server answered
    /// * `Err(AuthInvalid)` - Renewal failed, the user must sign in again
    /// * `Err(NetworkUnavailable | Timeout)` - No answer
    /// * `Err(StorageFailure)` - The credential could not be read
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn issue_request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut bearer = self.store.access_token().await?;
        let mut retried = false;

        loop {
            let response = match self.attempt(&request, bearer.as_deref()).await? {
                Attempt::Completed(response) => return Ok(response),
                Attempt::AuthExpired(response) => response,
            };
            if retried || self.is_renewal_call(&request) {
                return Ok(response);
            }
            retried = true;

            match self.recover(bearer.as_deref()).await? {
                Some(credential) => bearer = Some(credential.access_token),
                None => return Ok(response),
            }
            debug!("Retrying with renewed access token");
        }
    }

    async fn attempt(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<Attempt> {
        let response = self.transport.execute(request, bearer).await?;
        if response.is_unauthorized() {
            Ok(Attempt::AuthExpired(response))
        } else {
            Ok(Attempt::Completed(response))
        }
    }

    /// Find a credential worth retrying with after a 401.
    ///
    /// Returns `None` when the request went out anonymously and there is
    /// still nothing to authenticate with.
    async fn recover(&self, sent: Option<&str>) -> Result<Option<Credential>> {
        match (self.store.read().await?, sent) {
            // Someone renewed while this request was on the wire.
            (Some(current), _) if Some(current.access_token.as_str()) != sent => {
                debug!("Stored access token changed, skipping renewal");
                Ok(Some(current))
            }
            (None, None) => Ok(None),
            _ => self.renewal.renew().await.map(Some),
        }
    }

    fn is_renewal_call(&self, request: &ApiRequest) -> bool {
        request.path.trim_end_matches('/') == self.renewal_path.trim_end_matches('/')
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.issue_request(ApiRequest::get(path)).await?.into_data()
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::post(path).json(serde_json::to_value(body)?);
        self.issue_request(request).await?.into_data()
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::put(path).json(serde_json::to_value(body)?);
        self.issue_request(request).await?.into_data()
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::patch(path).json(serde_json::to_value(body)?);
        self.issue_request(request).await?.into_data()
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.issue_request(ApiRequest::delete(path)).await?.into_data()
    }
}
