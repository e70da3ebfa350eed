//! Error types for credential encryption, OAuth exchange, and token refresh.

use thiserror::Error;

/// The closed set of permanent refresh-failure codes (spec §4.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentFailureCode {
    RefreshTokenExpired,
    RefreshTokenReused,
    RefreshTokenInvalidated,
    AccountSuspended,
    AccountDeleted,
}

impl PermanentFailureCode {
    /// The wire code used by the upstream refresh endpoint and persisted
    /// alongside `deactivation_reason`.
    pub fn as_str(self) -> &'static str {
        match self {
            PermanentFailureCode::RefreshTokenExpired => "refresh_token_expired",
            PermanentFailureCode::RefreshTokenReused => "refresh_token_reused",
            PermanentFailureCode::RefreshTokenInvalidated => "refresh_token_invalidated",
            PermanentFailureCode::AccountSuspended => "account_suspended",
            PermanentFailureCode::AccountDeleted => "account_deleted",
        }
    }

    pub fn from_str(code: &str) -> Option<Self> {
        match code {
            "refresh_token_expired" => Some(PermanentFailureCode::RefreshTokenExpired),
            "refresh_token_reused" => Some(PermanentFailureCode::RefreshTokenReused),
            "refresh_token_invalidated" => Some(PermanentFailureCode::RefreshTokenInvalidated),
            "account_suspended" => Some(PermanentFailureCode::AccountSuspended),
            "account_deleted" => Some(PermanentFailureCode::AccountDeleted),
            _ => None,
        }
    }

    /// Human message keyed from the code (spec §7 table).
    pub fn message(self) -> &'static str {
        match self {
            PermanentFailureCode::RefreshTokenExpired => {
                "Refresh token expired - re-login required"
            }
            PermanentFailureCode::RefreshTokenReused => {
                "Refresh token was reused - re-login required"
            }
            PermanentFailureCode::RefreshTokenInvalidated => {
                "Refresh token was revoked - re-login required"
            }
            PermanentFailureCode::AccountSuspended => "Account has been suspended",
            PermanentFailureCode::AccountDeleted => "Account has been deleted",
        }
    }
}

/// Outcome of a failed token refresh (spec §4.3). Transient failures carry
/// no code and are propagated for the caller to retry later; permanent
/// failures carry a code from the closed set and must deactivate the
/// account immediately.
#[derive(Debug, Error)]
#[error("refresh failed: {message}")]
pub struct RefreshError {
    pub is_permanent: bool,
    pub code: Option<PermanentFailureCode>,
    pub message: String,
}

impl RefreshError {
    pub fn permanent(code: PermanentFailureCode) -> Self {
        Self {
            is_permanent: true,
            code: Some(code),
            message: code.message().to_string(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            is_permanent: false,
            code: None,
            message: message.into(),
        }
    }
}

/// Errors from credential encryption, OAuth exchange, and token refresh.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    /// Corrupted or tampered ciphertext. Callers treat this as permanent —
    /// the account cannot be used without re-login.
    #[error("invalid token ciphertext")]
    InvalidToken,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("store error: {0}")]
    Store(#[from] store::Error),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
