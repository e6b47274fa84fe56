//! Errors reported by the server API.

use serde::Deserialize;
use std::fmt;

/// Error codes the server puts in the `code` field of an error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Unauthorized,
    Forbidden,
    Invalid,
    Conflict,
    Internal,
    Other(String),
}

impl ErrorCode {
    fn parse(code: &str) -> Self {
        match code {
            "not found" => ErrorCode::NotFound,
            "unauthorized" => ErrorCode::Unauthorized,
            "forbidden" => ErrorCode::Forbidden,
            "invalid" => ErrorCode::Invalid,
            "conflict" => ErrorCode::Conflict,
            "internal error" => ErrorCode::Internal,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    fn from_status(status: u16) -> Self {
        match status {
            404 => ErrorCode::NotFound,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            400 | 422 => ErrorCode::Invalid,
            409 => ErrorCode::Conflict,
            _ => ErrorCode::Internal,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Invalid => "invalid",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Internal => "internal error",
            ErrorCode::Other(code) => code,
        }
    }
}

/// A failed API call, classified by error code.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: Option<u16>,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Classify an unsuccessful HTTP response from its status and body.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|b| b.code.as_deref())
            .map(ErrorCode::parse)
            .unwrap_or_else(|| ErrorCode::from_status(status));
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());

        Self {
            status: Some(status),
            code,
            message,
        }
    }

    /// True only for the server's "not found" classification.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.message.is_empty()) {
            (Some(status), true) => write!(f, "<{}> (HTTP {})", self.code.as_str(), status),
            (Some(status), false) => write!(f, "{} (HTTP {})", self.message, status),
            (None, true) => write!(f, "<{}>", self.code.as_str()),
            (None, false) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}
