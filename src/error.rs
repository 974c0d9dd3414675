//! Error surface of the CA core.
//!
//! Every command handler resolves to exactly one of these kinds; the router
//! turns the kind into an HTTP status and a JSON body. ACME endpoints carry
//! an RFC 8555 style problem `type` in addition to the status.

use serde_json::json;
use thiserror::Error;

/// ACME problem document types understood by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeErrorType {
    Malformed,
    Unauthorized,
    AccountDoesNotExist,
    BadCsr,
    IncorrectResponse,
    ServerInternal,
}

impl AcmeErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcmeErrorType::Malformed => "malformed",
            AcmeErrorType::Unauthorized => "unauthorized",
            AcmeErrorType::AccountDoesNotExist => "accountDoesNotExist",
            AcmeErrorType::BadCsr => "badCSR",
            AcmeErrorType::IncorrectResponse => "incorrectResponse",
            AcmeErrorType::ServerInternal => "serverInternal",
        }
    }

    /// Full problem `type` URN as it appears on the wire.
    pub fn urn(&self) -> String {
        format!("urn:ietf:params:acme:error:{}", self.as_str())
    }

    pub fn default_status(&self) -> u16 {
        match self {
            AcmeErrorType::Unauthorized => 401,
            AcmeErrorType::ServerInternal => 500,
            _ => 400,
        }
    }
}

/// Error kinds surfaced by the core.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Input shape invalid, field missing, number unparseable.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation such as already-revoked or already-whitelisted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// JWS verification failed or the account is unknown.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// ACME protocol error with an explicit problem type and status.
    #[error("acme error {}: {detail}", .acme_type.as_str())]
    Acme {
        acme_type: AcmeErrorType,
        detail: String,
        status: u16,
    },

    /// Filesystem or store failure outside the caller's control.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn acme(acme_type: AcmeErrorType, detail: impl Into<String>) -> Self {
        ApiError::Acme {
            status: acme_type.default_status(),
            acme_type,
            detail: detail.into(),
        }
    }

    pub fn acme_with_status(
        acme_type: AcmeErrorType,
        status: u16,
        detail: impl Into<String>,
    ) -> Self {
        ApiError::Acme {
            acme_type,
            detail: detail.into(),
            status,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) | ApiError::Conflict(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Unauthorized(_) => 401,
            ApiError::Acme { status, .. } => *status,
            ApiError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable kind used by the administrative surface.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad-request",
            ApiError::NotFound(_) => "not-found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Acme { .. } => "acme",
            ApiError::Internal(_) => "internal",
        }
    }

    /// JSON body for the administrative command surface.
    pub fn admin_body(&self) -> serde_json::Value {
        let message = match self {
            // Internal details stay in the log, not on the wire.
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        json!({ "ok": false, "error": self.kind(), "message": message })
    }

    /// RFC 8555 style problem document for the ACME surface.
    pub fn acme_body(&self) -> serde_json::Value {
        match self {
            ApiError::Acme {
                acme_type, detail, ..
            } => json!({ "type": acme_type.urn(), "detail": detail }),
            ApiError::Unauthorized(detail) => json!({
                "type": AcmeErrorType::Unauthorized.urn(),
                "detail": detail,
            }),
            ApiError::NotFound(detail) => json!({
                "type": AcmeErrorType::Malformed.urn(),
                "detail": detail,
            }),
            ApiError::Internal(_) => json!({
                "type": AcmeErrorType::ServerInternal.urn(),
                "detail": "internal error",
            }),
            other => json!({
                "type": AcmeErrorType::Malformed.urn(),
                "detail": other.to_string(),
            }),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Internal(anyhow::Error::new(e).context("store operation failed"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("invalid JSON: {e}"))
    }
}
