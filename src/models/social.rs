// Canonical shapes for tracked profiles and the content scraped from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    Facebook,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Instagram, Platform::Tiktok, Platform::Facebook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Facebook => "facebook",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "facebook" => Ok(Platform::Facebook),
            other => Err(AppError::Validation(format!("Unsupported platform: {}", other))),
        }
    }
}

/// Kind of scrape job run against a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Posts,
    Comments,
}

impl ContentType {
    pub const ALL: [ContentType; 2] = [ContentType::Posts, ContentType::Comments];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Posts => "posts",
            ContentType::Comments => "comments",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posts" => Ok(ContentType::Posts),
            "comments" => Ok(ContentType::Comments),
            other => Err(AppError::Validation(format!("Unsupported content type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
    Unclassified,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 4] = [
        SentimentLabel::Positive,
        SentimentLabel::Negative,
        SentimentLabel::Neutral,
        SentimentLabel::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "POSITIVE",
            SentimentLabel::Negative => "NEGATIVE",
            SentimentLabel::Neutral => "NEUTRAL",
            SentimentLabel::Unclassified => "UNCLASSIFIED",
        }
    }

    pub fn is_classified(&self) -> bool {
        *self != SentimentLabel::Unclassified
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Ok(SentimentLabel::Positive),
            "NEGATIVE" => Ok(SentimentLabel::Negative),
            "NEUTRAL" => Ok(SentimentLabel::Neutral),
            "UNCLASSIFIED" => Ok(SentimentLabel::Unclassified),
            other => Err(AppError::Validation(format!("Unknown sentiment label: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationSource {
    #[serde(rename = "keyword-rule")]
    KeywordRule,
    #[serde(rename = "model")]
    Model,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::KeywordRule => "keyword-rule",
            ClassificationSource::Model => "model",
        }
    }
}

impl FromStr for ClassificationSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword-rule" => Ok(ClassificationSource::KeywordRule),
            "model" => Ok(ClassificationSource::Model),
            other => Err(AppError::Validation(format!("Unknown classification source: {}", other))),
        }
    }
}

/// Outcome of classifying one comment text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub confidence: f64,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub platform: Platform,
    pub handle: String,
    pub display_name: Option<String>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProfile {
    pub platform: Platform,
    pub handle: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub profile_id: i64,
    pub platform: Platform,
    pub native_id: String,
    pub url: Option<String>,
    pub text: Option<String>,
    pub likes: i64,
    pub comments_count: i64,
    pub shares: i64,
    pub views: i64,
    pub interactions_total: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

/// A post as produced by normalization, before it has a storage identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub native_id: String,
    pub url: Option<String>,
    pub text: Option<String>,
    pub likes: i64,
    pub comments_count: i64,
    pub shares: i64,
    pub views: i64,
    pub posted_at: Option<DateTime<Utc>>,
}

impl NewPost {
    pub fn interactions_total(&self) -> i64 {
        self.likes + self.comments_count + self.shares + self.views
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub native_id: String,
    pub author: Option<String>,
    pub text: Option<String>,
    pub likes: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub sentiment_label: SentimentLabel,
    pub sentiment_confidence: Option<f64>,
    pub classification_source: Option<ClassificationSource>,
    pub classified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub native_id: String,
    pub author: Option<String>,
    pub text: Option<String>,
    pub likes: i64,
    pub posted_at: Option<DateTime<Utc>>,
}
