use std::sync::Arc;

use crate::error::AppResult;
use crate::infrastructure::PipelineSettings;
use crate::models::{ClassificationSource, Sentiment, SentimentLabel};
use crate::sentiment::inference::InferenceHandle;

pub const KEYWORD_CONFIDENCE: f64 = 0.9;
pub const EMPTY_TEXT_CONFIDENCE: f64 = 0.5;
pub const MAX_MODEL_INPUT_CHARS: usize = 512;

/// Case-folded substring rules. The positive set is checked first, so it wins ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordRules {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl KeywordRules {
    pub fn new(positive: &[String], negative: &[String]) -> Self {
        let fold = |words: &[String]| -> Vec<String> {
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect()
        };
        Self {
            positive: fold(positive),
            negative: fold(negative),
        }
    }

    /// `None` means no rule applies and the model has to decide.
    pub fn classify(&self, text: Option<&str>) -> Option<Sentiment> {
        let text = text.map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return Some(Sentiment {
                label: SentimentLabel::Neutral,
                confidence: EMPTY_TEXT_CONFIDENCE,
                source: ClassificationSource::KeywordRule,
            });
        }

        let folded = text.to_lowercase();
        let label = if self.positive.iter().any(|w| folded.contains(w.as_str())) {
            SentimentLabel::Positive
        } else if self.negative.iter().any(|w| folded.contains(w.as_str())) {
            SentimentLabel::Negative
        } else {
            return None;
        };
        Some(Sentiment {
            label,
            confidence: KEYWORD_CONFIDENCE,
            source: ClassificationSource::KeywordRule,
        })
    }
}

/// Maps provider-specific labels onto the closed label set.
pub fn map_provider_label(label: &str) -> SentimentLabel {
    let upper = label.trim().to_ascii_uppercase();
    match upper.as_str() {
        "LABEL_0" => SentimentLabel::Negative,
        "LABEL_1" => SentimentLabel::Neutral,
        "LABEL_2" => SentimentLabel::Positive,
        _ if upper.contains("POS") => SentimentLabel::Positive,
        _ if upper.contains("NEG") => SentimentLabel::Negative,
        _ => SentimentLabel::Neutral,
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Two-tier classifier bound to one settings snapshot.
pub struct SentimentClassifier {
    rules: KeywordRules,
    model_id: String,
    inference: Arc<InferenceHandle>,
}

impl SentimentClassifier {
    pub fn new(settings: &PipelineSettings, inference: Arc<InferenceHandle>) -> Self {
        Self {
            rules: KeywordRules::new(&settings.keywords_positive, &settings.keywords_negative),
            model_id: settings.huggingface_model.clone(),
            inference,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Classifies one comment text. A model load failure surfaces as `ClassifierUnavailable`.
    pub async fn classify(&self, text: Option<&str>) -> AppResult<Sentiment> {
        if let Some(sentiment) = self.rules.classify(text) {
            return Ok(sentiment);
        }

        let input = truncate_chars(text.unwrap_or_default().trim(), MAX_MODEL_INPUT_CHARS);
        let prediction = self.inference.predict(&self.model_id, input).await?;
        Ok(Sentiment {
            label: map_provider_label(&prediction.label),
            confidence: prediction.score.clamp(0.0, 1.0),
            source: ClassificationSource::Model,
        })
    }
}
