// Model inference behind a lazily loaded, process-wide handle.
//
// The handle owns at most one loaded backend. Loading happens under a single async mutex, so
// concurrent first users wait for the same attempt and observe its outcome. A failed load is
// remembered for a cooldown window; callers inside that window get the recorded failure back
// without triggering another load.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::InferenceConfig;
use crate::error::AppError;

pub const FALLBACK_MODEL: &str = "distilbert-base-uncased-finetuned-sst-2-english";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("Model {model} could not be loaded: {message}")]
    Load { model: String, message: String },

    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Unexpected inference response: {0}")]
    Parse(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
}

impl From<InferenceError> for AppError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Load { .. } => AppError::ClassifierUnavailable(err.to_string()),
            other => AppError::ExternalService(other.to_string()),
        }
    }
}

/// Raw provider output: provider-specific label and its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub score: f64,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// The model actually serving predictions; may be a fallback of the one requested.
    fn model_id(&self) -> &str;

    async fn predict(&self, text: &str) -> Result<Prediction, InferenceError>;
}

#[async_trait]
pub trait InferenceLoader: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn InferenceBackend>, InferenceError>;
}

struct LoadFailure {
    model: String,
    error: InferenceError,
    at: Instant,
}

#[derive(Default)]
struct Slot {
    requested_model: Option<String>,
    backend: Option<Arc<dyn InferenceBackend>>,
    failure: Option<LoadFailure>,
    loads: u64,
}

/// Snapshot of the handle for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceStatus {
    /// A load is in progress; the other fields are unknown until it finishes.
    pub loading: bool,
    pub requested_model: Option<String>,
    pub serving_model: Option<String>,
    pub last_failure: Option<String>,
    pub load_attempts: u64,
}

pub struct InferenceHandle {
    loader: Arc<dyn InferenceLoader>,
    slot: Mutex<Slot>,
    retry_cooldown: Duration,
    call_timeout: Duration,
}

impl InferenceHandle {
    pub fn new(loader: Arc<dyn InferenceLoader>, retry_cooldown: Duration, call_timeout: Duration) -> Self {
        Self {
            loader,
            slot: Mutex::new(Slot::default()),
            retry_cooldown,
            call_timeout,
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(
            Arc::new(HuggingFaceLoader::new(config)),
            config.retry_cooldown(),
            config.timeout(),
        )
    }

    /// Returns the loaded backend for `model_id`, loading it first if needed.
    pub async fn backend(&self, model_id: &str) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
        let mut slot = self.slot.lock().await;

        if slot.requested_model.as_deref() == Some(model_id) {
            if let Some(backend) = &slot.backend {
                return Ok(backend.clone());
            }
        }
        if let Some(failure) = &slot.failure {
            if failure.model == model_id && failure.at.elapsed() < self.retry_cooldown {
                return Err(failure.error.clone());
            }
        }

        if slot.backend.is_some() {
            info!(from = ?slot.requested_model, to = model_id, "model changed, reloading");
        }
        slot.backend = None;
        slot.requested_model = Some(model_id.to_string());
        slot.loads += 1;

        let outcome = match tokio::time::timeout(self.call_timeout, self.loader.load(model_id)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Load {
                model: model_id.to_string(),
                message: format!("timed out after {:?}", self.call_timeout),
            }),
        };

        match outcome {
            Ok(backend) => {
                info!(requested = model_id, serving = backend.model_id(), "inference backend loaded");
                slot.backend = Some(backend.clone());
                slot.failure = None;
                Ok(backend)
            }
            Err(err) => {
                let err = match err {
                    load @ InferenceError::Load { .. } => load,
                    other => InferenceError::Load {
                        model: model_id.to_string(),
                        message: other.to_string(),
                    },
                };
                warn!(model = model_id, error = %err, "inference backend unavailable");
                slot.failure = Some(LoadFailure {
                    model: model_id.to_string(),
                    error: err.clone(),
                    at: Instant::now(),
                });
                Err(err)
            }
        }
    }

    pub async fn predict(&self, model_id: &str, text: &str) -> Result<Prediction, InferenceError> {
        let backend = self.backend(model_id).await?;
        tokio::time::timeout(self.call_timeout, backend.predict(text))
            .await
            .map_err(|_| InferenceError::Timeout(self.call_timeout))?
    }

    /// Never waits on a load in progress.
    pub fn status(&self) -> InferenceStatus {
        let Ok(slot) = self.slot.try_lock() else {
            return InferenceStatus {
                loading: true,
                requested_model: None,
                serving_model: None,
                last_failure: None,
                load_attempts: 0,
            };
        };
        InferenceStatus {
            loading: false,
            requested_model: slot.requested_model.clone(),
            serving_model: slot.backend.as_ref().map(|b| b.model_id().to_string()),
            last_failure: slot.failure.as_ref().map(|f| f.error.to_string()),
            load_attempts: slot.loads,
        }
    }
}

/// Loads models from the Hugging Face hosted inference API.
pub struct HuggingFaceLoader {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HuggingFaceLoader {
    pub fn new(config: &InferenceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl InferenceLoader for HuggingFaceLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
        let mut candidates = vec![model_id];
        if model_id != FALLBACK_MODEL {
            candidates.push(FALLBACK_MODEL);
        }

        let mut errors = Vec::new();
        for candidate in candidates {
            let backend = HuggingFaceBackend {
                client: self.client.clone(),
                endpoint: format!("{}/{}", self.base_url, candidate),
                api_token: self.api_token.clone(),
                model_id: candidate.to_string(),
            };
            // Warm-up request; blocks until the provider has the model in memory.
            match backend.predict("warm up").await {
                Ok(_) => return Ok(Arc::new(backend)),
                Err(err) => {
                    warn!(model = candidate, error = %err, "model warm-up failed");
                    errors.push(format!("{}: {}", candidate, err));
                }
            }
        }

        Err(InferenceError::Load {
            model: model_id.to_string(),
            message: errors.join("; "),
        })
    }
}

struct HuggingFaceBackend {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    model_id: String,
}

#[async_trait]
impl InferenceBackend for HuggingFaceBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn predict(&self, text: &str) -> Result<Prediction, InferenceError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "inputs": text, "options": { "wait_for_model": true } }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Request(format!("status {}: {}", status.as_u16(), body)));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| InferenceError::Parse(e.to_string()))?;
        best_prediction(&body)
    }
}

/// Picks the highest-scoring label from `[{label, score}]` or `[[{label, score}]]`.
pub fn best_prediction(body: &Value) -> Result<Prediction, InferenceError> {
    let candidates = match body {
        Value::Array(outer) => match outer.first() {
            Some(Value::Array(inner)) => inner.as_slice(),
            _ => outer.as_slice(),
        },
        other => return Err(InferenceError::Parse(other.to_string())),
    };

    candidates
        .iter()
        .filter_map(|c| serde_json::from_value::<Prediction>(c.clone()).ok())
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .ok_or_else(|| InferenceError::Parse(body.to_string()))
}
