//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient coins: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid user id: {0}")]
    InvalidUser(String),

    #[error("Referral code already used")]
    AlreadyUsed,

    #[error("Cannot apply your own referral code")]
    SelfReferral,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event parse error: {0}")]
    EventParse(String),
}

impl LedgerError {
    /// Whether the store rejected the transaction because of a concurrent
    /// writer. These are retried by [`crate::db::transact`] and never reach
    /// callers unless the retry budget runs out.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::Database(db_err)) => {
                // SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes.
                let primary = db_err
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                matches!(primary, Some(5) | Some(6))
                    || db_err.message().contains("database is locked")
            }
            LedgerError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Stable machine-readable identifier used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InvalidUser(_) => "invalid_user",
            LedgerError::AlreadyUsed => "already_used",
            LedgerError::SelfReferral => "self_referral",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::SignatureInvalid => "signature_invalid",
            LedgerError::Database(_) | LedgerError::Migrate(_) => "storage_error",
            LedgerError::Json(_) | LedgerError::EventParse(_) => "bad_payload",
            LedgerError::Config(_) => "config_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
