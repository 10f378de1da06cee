// Hybrid sentiment classification: keyword rules first, hosted model as fallback.
pub mod classifier;
pub mod inference;

pub use classifier::{map_provider_label, KeywordRules, SentimentClassifier};
pub use inference::{
    HuggingFaceLoader, InferenceBackend, InferenceError, InferenceHandle, InferenceLoader,
    InferenceStatus, Prediction,
};
