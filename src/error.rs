//! Batch processing error taxonomy
//!
//! Any of these rejects the whole batch for redelivery; partial
//! acknowledgment is never attempted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumeError {
    /// Unparseable message body or missing required fields
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The external classifier failed; partial inference state cannot be
    /// safely merged, so the batch is rejected as a unit
    #[error("classifier failure: {0}")]
    Classifier(#[source] anyhow::Error),

    /// The classifier broke the positional-pairing contract
    #[error("classifier returned {got} predictions for {expected} events")]
    PredictionMismatch { expected: usize, got: usize },
}
