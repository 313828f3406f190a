//! Uniform API response envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    Success,
    Error,
}

/// Error details carried by an `ERROR` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `{ resultType, data, error, timestamp }` wrapper around every API payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub result_type: ResultType,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Unwrap the payload of a response with the given HTTP status.
    ///
    /// A `SUCCESS` envelope without `data` is accepted for payload types that
    /// deserialize from `null` (`()`, `Option<_>`, `serde_json::Value`).
    pub fn into_data(self, status: u16) -> Result<T> {
        match self.result_type {
            ResultType::Success => match self.data {
                Some(data) => Ok(data),
                None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                    SessionError::malformed("SUCCESS envelope without data")
                }),
            },
            ResultType::Error => {
                let error = self.error.unwrap_or_default();
                Err(SessionError::Api {
                    status,
                    code: error.code,
                    message: error.message,
                })
            }
        }
    }
}
