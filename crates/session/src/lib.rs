//! Session core of the barter client.
//!
//! - [`CredentialStore`] keeps the access/refresh token pair, cached in memory
//!   and mirrored to a [`SecureStorage`] backend.
//! - [`RenewalCoordinator`] makes sure at most one renewal call is in flight.
//! - [`RequestPipeline`] attaches the access token to outgoing requests and
//!   retries once after a 401.
//! - [`Session`] wires the three together and adds sign-in/sign-out.

pub mod auth;
pub mod config;
pub mod credential;
pub mod envelope;
pub mod error;
pub mod http;
pub mod logging;
pub mod pipeline;
pub mod renewal;
pub mod session;
pub mod storage;
pub mod store;

pub use crate::{
    config::SessionConfig,
    credential::{Credential, TokenClaims},
    envelope::{ApiErrorBody, Envelope, ResultType},
    error::{Result, SessionError},
    http::{ApiRequest, ApiResponse, HttpTransport, Method, ReqwestTransport},
    logging::{DEFAULT_LOG_FILTER, LogFormat, init_logging},
    pipeline::RequestPipeline,
    renewal::{
        HttpRenewalClient, RenewalClient, RenewalCoordinator, SessionEndReason, SessionExpired,
    },
    session::Session,
    storage::{FileStorage, MemoryStorage, SecureStorage},
    store::CredentialStore,
};
