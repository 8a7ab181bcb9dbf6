pub mod client;
pub mod gl;
pub mod slack;

use thiserror::Error;

pub use client::{
    ApprovalApi, BatchAck, BatchPayload, EnrichmentData, EnrichmentPayload, GlQuery,
    HttpApprovalClient, NewPattern, SuggestionAck, SuggestionPayload, SuggestionRecord,
};
pub use gl::GlFetcher;
pub use slack::SlackNotifier;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("transient approval-service error: {0}")]
    Transient(String),
    #[error("approval-service error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode approval-service response: {0}")]
    Decode(String),
}

impl ApprovalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApprovalError::Transient(_))
    }
}
