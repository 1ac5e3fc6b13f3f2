//! Classifier collaborator contract
//!
//! The core consumes classification through a narrow trait: a batch of
//! feature records in, a same-length, same-order list of predictions out.
//! Feature preprocessing and model inference live behind this seam.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::{FeatureRecord, Label};

/// One classification outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class: Label,
    pub confidence: f32,
}

impl Prediction {
    /// Synthetic result for traffic that skips inference entirely
    pub fn auto_normal() -> Self {
        Self {
            predicted_class: Label::Normal,
            confidence: 0.0,
        }
    }
}

/// External classifier seam. Implementations must return exactly one
/// prediction per input record, in input order, and tolerate batch size 1.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, batch: &[FeatureRecord]) -> Result<Vec<Prediction>>;
}

/// HTTP client for a remote inference service exposing a `/predict`
/// endpoint that accepts `{"data": [...]}` and returns a prediction list.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: &'a [FeatureRecord],
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, batch: &[FeatureRecord]) -> Result<Vec<Prediction>> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&PredictRequest { data: batch })
            .send()
            .await
            .with_context(|| format!("inference request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("inference service returned HTTP {}", status));
        }

        let predictions: Vec<Prediction> = response
            .json()
            .await
            .context("invalid inference response body")?;

        if predictions.len() != batch.len() {
            return Err(anyhow!(
                "inference service returned {} predictions for {} records",
                predictions.len(),
                batch.len()
            ));
        }

        Ok(predictions)
    }
}
