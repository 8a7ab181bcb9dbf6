pub mod client;
pub mod retry;
pub mod sca;
pub mod statement;

use thiserror::Error;

pub use client::{BankClient, MAX_STATEMENT_DAYS};
pub use retry::{RateLimiter, RetryPolicy};
pub use sca::{ScaSession, ScaSigner, SessionCache};
pub use statement::{Statement, StatementError, WireBalance, WireProfile, WireTransaction};

#[derive(Debug, Error)]
pub enum BankError {
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("second-factor signing failed: {0}")]
    SigningFailed(String),
    #[error("statement window exceeds {MAX_STATEMENT_DAYS} days")]
    RangeTooLarge,
    #[error("transient bank error: {0}")]
    Transient(String),
    #[error("bank API error {status}: {body}")]
    Fatal { status: u16, body: String },
    #[error("failed to decode bank response: {0}")]
    Decode(String),
}

impl BankError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BankError::Transient(_))
    }

    /// Auth and signing failures must stop the batch and keep the cursor
    /// where it was.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            BankError::AuthRequired(_) | BankError::SigningFailed(_)
        )
    }
}
