//! Account endpoints: sign-in, sign-up and sign-out.
//!
//! These calls go straight to the transport rather than through the request
//! pipeline. A 401 from the login endpoint means bad credentials, not an
//! expired token, and must never start a renewal.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::credential::Credential;
use crate::error::Result;
use crate::http::{ApiRequest, HttpTransport};

#[derive(Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub nickname: String,
}

impl fmt::Debug for SignInRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInRequest")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("email", &self.email)
            .field("nickname", &self.nickname)
            .finish_non_exhaustive()
    }
}

/// Thin client for the `auth` and `users` routes.
pub struct AuthApi<'a> {
    transport: &'a dyn HttpTransport,
    config: &'a SessionConfig,
}

impl<'a> AuthApi<'a> {
    pub fn new(transport: &'a dyn HttpTransport, config: &'a SessionConfig) -> Self {
        Self { transport, config }
    }

    /// `POST {prefix}/auth/login`. Does not touch the credential store.
    #[instrument(skip_all, fields(email = %request.email))]
    pub async fn sign_in(&self, request: &SignInRequest) -> Result<Credential> {
        let request = ApiRequest::post(self.config.endpoint("auth/login"))
            .json(serde_json::to_value(request)?);
        let credential: Credential = self.transport.execute(&request, None).await?.into_data()?;
        info!("Signed in");
        Ok(credential.with_claims_fallback())
    }

    /// `POST {prefix}/users`. The server returns the new account, not a token.
    #[instrument(skip_all, fields(email = %request.email, nickname = %request.nickname))]
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<serde_json::Value> {
        let request =
            ApiRequest::post(self.config.endpoint("users")).json(serde_json::to_value(request)?);
        let account = self.transport.execute(&request, None).await?.into_data()?;
        info!("Account created");
        Ok(account)
    }

    /// `POST {prefix}/auth/logout` with the given token, best effort.
    pub async fn sign_out(&self, access_token: &str) {
        let request = ApiRequest::post(self.config.endpoint("auth/logout"));
        let result = self
            .transport
            .execute(&request, Some(access_token))
            .await
            .and_then(|response| response.into_data::<()>());
        if let Err(e) = result {
            warn!(error = %e, "Server-side logout failed");
        }
    }
}
