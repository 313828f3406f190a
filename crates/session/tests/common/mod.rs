//! In-memory stand-in for the barter API.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use barter_session::{
    ApiRequest, ApiResponse, HttpRenewalClient, HttpTransport, MemoryStorage, Method, Result,
    SecureStorage, Session, SessionConfig,
};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
}

#[derive(Default)]
struct FakeState {
    valid_access: String,
    valid_refresh: String,
    generation: u32,
    reject_refresh: bool,
    users: Vec<(String, String)>,
    requests: Vec<Recorded>,
}

/// Issues `access-N`/`refresh-N` tokens and checks bearers like the real server.
pub struct FakeApi {
    state: Mutex<FakeState>,
    refresh_delay: Duration,
}

impl FakeApi {
    pub fn new(refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                users: vec![("ada@example.com".into(), "hunter2".into())],
                ..FakeState::default()
            }),
            refresh_delay,
        })
    }

    /// Invalidate the current access token without touching the refresh token.
    pub fn expire_access_token(&self) {
        self.state.lock().valid_access.clear();
    }

    pub fn reject_refresh(&self) {
        self.state.lock().reject_refresh = true;
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    fn issue_tokens(state: &mut FakeState) -> serde_json::Value {
        state.generation += 1;
        state.valid_access = format!("access-{}", state.generation);
        state.valid_refresh = format!("refresh-{}", state.generation);
        json!({
            "accessToken": state.valid_access,
            "accessTokenIssuedAt": "2025-03-01T10:00:00",
            "accessTokenExpiredAt": "2025-03-01T11:00:00",
            "refreshToken": state.valid_refresh,
            "refreshTokenIssuedAt": "2025-03-01T10:00:00",
            "refreshTokenExpiredAt": "2025-03-15T10:00:00",
        })
    }
}

fn success(data: serde_json::Value) -> ApiResponse {
    ApiResponse::new(
        200,
        json!({ "resultType": "SUCCESS", "data": data }).to_string(),
    )
}

fn failure(status: u16, code: &str) -> ApiResponse {
    ApiResponse::new(
        status,
        json!({ "resultType": "ERROR", "error": { "code": code, "message": code } }).to_string(),
    )
}

#[async_trait]
impl HttpTransport for FakeApi {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        self.state.lock().requests.push(Recorded {
            method: request.method,
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
        });
        let body = request.body.clone().unwrap_or_default();

        match request.path.as_str() {
            "/api/v1/auth/refresh" => {
                tokio::time::sleep(self.refresh_delay).await;
                let mut state = self.state.lock();
                if state.reject_refresh || body["refreshToken"] != state.valid_refresh.as_str() {
                    return Ok(failure(401, "INVALID_REFRESH_TOKEN"));
                }
                Ok(success(Self::issue_tokens(&mut state)))
            }
            "/api/v1/auth/login" => {
                let mut state = self.state.lock();
                let known = state.users.iter().any(|(email, password)| {
                    body["email"] == email.as_str() && body["password"] == password.as_str()
                });
                if !known {
                    return Ok(failure(401, "INVALID_CREDENTIALS"));
                }
                Ok(success(Self::issue_tokens(&mut state)))
            }
            "/api/v1/users" => {
                let mut state = self.state.lock();
                let email = body["email"].as_str().unwrap_or_default().to_string();
                if state.users.iter().any(|(known, _)| *known == email) {
                    return Ok(failure(409, "DUPLICATE_EMAIL"));
                }
                let password = body["password"].as_str().unwrap_or_default().to_string();
                state.users.push((email.clone(), password));
                Ok(success(json!({ "email": email, "nickname": body["nickname"] })))
            }
            "/api/v1/auth/logout" => Ok(success(serde_json::Value::Null)),
            path => {
                let state = self.state.lock();
                if bearer.is_some_and(|b| !b.is_empty() && b == state.valid_access) {
                    Ok(success(json!({ "path": path })))
                } else {
                    Ok(failure(401, "EXPIRED_TOKEN"))
                }
            }
        }
    }
}

pub fn session_with(api: &Arc<FakeApi>, storage: Arc<dyn SecureStorage>) -> Arc<Session> {
    let config = SessionConfig::default();
    let renewal = HttpRenewalClient::with_transport(api.clone(), config.refresh_path());
    Arc::new(Session::from_parts(
        config,
        storage,
        api.clone(),
        Arc::new(renewal),
    ))
}

pub fn session(api: &Arc<FakeApi>) -> Arc<Session> {
    session_with(api, Arc::new(MemoryStorage::new()))
}
