use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChatKey, SessionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Validation,
    RateLimited,
    Provider,
    Internal,
}

/// Wire-level error body returned by the aggregator API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session `{0}` has no open push connection")]
    NotConnected(SessionKey),
    #[error("history fetch failed for chat `{chat}`: {reason}")]
    FetchFailed { chat: ChatKey, reason: String },
    #[error("send failed for chat `{chat}`: {reason}")]
    SendFailed { chat: ChatKey, reason: String },
    #[error("invalid chat key `{input}`: expected `platform:account:chat`")]
    InvalidChatKey { input: String },
}
