// ConfigStore - versioned pipeline tunables persisted next to the data they govern.
//
// Keys form a closed set. Each value is stored as text with a type tag: plain strings as-is,
// string lists as JSON arrays, integers in decimal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::infrastructure::database::DatabaseInterface;
use crate::models::{ContentType, Platform};

pub const DEFAULT_MODEL: &str = "cardiffnlp/twitter-xlm-roberta-base-sentiment";
pub const MIN_TOKEN_LEN: usize = 10;
pub const MAX_LIMIT: i64 = 10_000;

const DEFAULT_POSITIVE: &[&str] = &[
    "excelente", "recomiendo", "genial", "perfecto", "amazing", "great", "love", "best",
];
const DEFAULT_NEGATIVE: &[&str] = &[
    "malo", "horrible", "terrible", "pésimo", "bad", "worst", "hate", "disappointed",
];

/// Raw stored entry as read from either backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValueType {
    String,
    StringList,
    Integer,
}

impl ConfigValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigValueType::String => "string",
            ConfigValueType::StringList => "string_list",
            ConfigValueType::Integer => "integer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Integer(i64),
    String(String),
    StringList(Vec<String>),
}

impl ConfigValue {
    pub fn value_type(&self) -> ConfigValueType {
        match self {
            ConfigValue::String(_) => ConfigValueType::String,
            ConfigValue::StringList(_) => ConfigValueType::StringList,
            ConfigValue::Integer(_) => ConfigValueType::Integer,
        }
    }

    fn encode(&self) -> AppResult<String> {
        match self {
            ConfigValue::String(s) => Ok(s.clone()),
            ConfigValue::StringList(items) => serde_json::to_string(items)
                .map_err(|e| AppError::Internal(format!("Failed to encode list: {}", e))),
            ConfigValue::Integer(n) => Ok(n.to_string()),
        }
    }

    fn decode(value_type: ConfigValueType, raw: &str) -> Result<Self, String> {
        match value_type {
            ConfigValueType::String => Ok(ConfigValue::String(raw.to_string())),
            ConfigValueType::StringList => serde_json::from_str::<Vec<String>>(raw)
                .map(ConfigValue::StringList)
                .map_err(|e| format!("expected a JSON list of strings: {}", e)),
            ConfigValueType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(ConfigValue::Integer)
                .map_err(|e| format!("expected an integer: {}", e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ApifyToken,
    HuggingfaceModel,
    Actor(Platform, ContentType),
    KeywordsPositive,
    KeywordsNegative,
    DefaultLimitPosts,
    DefaultLimitComments,
}

impl ConfigKey {
    pub fn all() -> Vec<ConfigKey> {
        let mut keys = vec![ConfigKey::ApifyToken, ConfigKey::HuggingfaceModel];
        for platform in Platform::ALL {
            for content_type in ContentType::ALL {
                keys.push(ConfigKey::Actor(platform, content_type));
            }
        }
        keys.extend([
            ConfigKey::KeywordsPositive,
            ConfigKey::KeywordsNegative,
            ConfigKey::DefaultLimitPosts,
            ConfigKey::DefaultLimitComments,
        ]);
        keys
    }

    pub fn name(&self) -> String {
        match self {
            ConfigKey::ApifyToken => "apify_token".to_string(),
            ConfigKey::HuggingfaceModel => "huggingface_model".to_string(),
            ConfigKey::Actor(platform, content_type) => {
                format!("actor_{}_{}", platform.as_str(), content_type.as_str())
            }
            ConfigKey::KeywordsPositive => "keywords_positive".to_string(),
            ConfigKey::KeywordsNegative => "keywords_negative".to_string(),
            ConfigKey::DefaultLimitPosts => "default_limit_posts".to_string(),
            ConfigKey::DefaultLimitComments => "default_limit_comments".to_string(),
        }
    }

    pub fn value_type(&self) -> ConfigValueType {
        match self {
            ConfigKey::ApifyToken | ConfigKey::HuggingfaceModel | ConfigKey::Actor(..) => {
                ConfigValueType::String
            }
            ConfigKey::KeywordsPositive | ConfigKey::KeywordsNegative => {
                ConfigValueType::StringList
            }
            ConfigKey::DefaultLimitPosts | ConfigKey::DefaultLimitComments => {
                ConfigValueType::Integer
            }
        }
    }

    pub fn default_value(&self) -> ConfigValue {
        match self {
            ConfigKey::ApifyToken => ConfigValue::String(String::new()),
            ConfigKey::HuggingfaceModel => ConfigValue::String(DEFAULT_MODEL.to_string()),
            ConfigKey::Actor(platform, content_type) => {
                ConfigValue::String(default_actor(*platform, *content_type).to_string())
            }
            ConfigKey::KeywordsPositive => ConfigValue::StringList(to_strings(DEFAULT_POSITIVE)),
            ConfigKey::KeywordsNegative => ConfigValue::StringList(to_strings(DEFAULT_NEGATIVE)),
            ConfigKey::DefaultLimitPosts => ConfigValue::Integer(50),
            ConfigKey::DefaultLimitComments => ConfigValue::Integer(200),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, ConfigKey::ApifyToken)
    }

    /// Normalizes a candidate value, or explains why it is not acceptable for this key.
    fn validate(&self, value: ConfigValue) -> AppResult<ConfigValue> {
        let key = self.name();
        match (self, value) {
            (ConfigKey::ApifyToken, ConfigValue::String(token)) => {
                let token = token.trim().to_string();
                if token.len() < MIN_TOKEN_LEN {
                    return Err(AppError::Validation(format!(
                        "apify_token must be at least {} characters",
                        MIN_TOKEN_LEN
                    )));
                }
                Ok(ConfigValue::String(token))
            }
            (ConfigKey::HuggingfaceModel | ConfigKey::Actor(..), ConfigValue::String(id)) => {
                let id = id.trim().to_string();
                if id.is_empty() || id.chars().any(char::is_whitespace) {
                    return Err(AppError::Validation(format!(
                        "{} must be a non-empty identifier without spaces",
                        key
                    )));
                }
                Ok(ConfigValue::String(id))
            }
            (ConfigKey::KeywordsPositive | ConfigKey::KeywordsNegative, ConfigValue::StringList(words)) => {
                let mut cleaned: Vec<String> = Vec::new();
                for word in words {
                    let word = word.trim().to_lowercase();
                    if !word.is_empty() && !cleaned.contains(&word) {
                        cleaned.push(word);
                    }
                }
                Ok(ConfigValue::StringList(cleaned))
            }
            (ConfigKey::DefaultLimitPosts | ConfigKey::DefaultLimitComments, ConfigValue::Integer(n)) => {
                if !(1..=MAX_LIMIT).contains(&n) {
                    return Err(AppError::Validation(format!(
                        "{} must be between 1 and {}",
                        key, MAX_LIMIT
                    )));
                }
                Ok(ConfigValue::Integer(n))
            }
            (_, other) => Err(AppError::Validation(format!(
                "{} expects a {} value, got {}",
                key,
                self.value_type().as_str(),
                other.value_type().as_str()
            ))),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::all()
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown config key: {}", s)))
    }
}

fn default_actor(platform: Platform, content_type: ContentType) -> &'static str {
    match (platform, content_type) {
        (Platform::Instagram, ContentType::Posts) => "shu8hvrXbJbY3Eb9W",
        (Platform::Instagram, ContentType::Comments) => "instagram-comment-scraper",
        (Platform::Tiktok, ContentType::Posts) => "GdWCkxBtKWOsKjdch",
        (Platform::Tiktok, ContentType::Comments) => "tiktok-comments-scraper",
        (Platform::Facebook, ContentType::Posts) => "apify/facebook-posts-scraper",
        (Platform::Facebook, ContentType::Comments) => "us5srxAYnsrkgUv2v",
    }
}

fn to_strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// Token shown as its first and last four characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Every tunable a run needs, read once at run start.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub apify_token: String,
    pub huggingface_model: String,
    pub actors: HashMap<(Platform, ContentType), String>,
    pub keywords_positive: Vec<String>,
    pub keywords_negative: Vec<String>,
    pub default_limit_posts: i64,
    pub default_limit_comments: i64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let mut actors = HashMap::new();
        for platform in Platform::ALL {
            for content_type in ContentType::ALL {
                actors.insert(
                    (platform, content_type),
                    default_actor(platform, content_type).to_string(),
                );
            }
        }
        Self {
            apify_token: String::new(),
            huggingface_model: DEFAULT_MODEL.to_string(),
            actors,
            keywords_positive: to_strings(DEFAULT_POSITIVE),
            keywords_negative: to_strings(DEFAULT_NEGATIVE),
            default_limit_posts: 50,
            default_limit_comments: 200,
        }
    }
}

impl PipelineSettings {
    pub fn actor(&self, platform: Platform, content_type: ContentType) -> Option<&str> {
        self.actors
            .get(&(platform, content_type))
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }

    /// Checks that a run over `platforms` can be attempted at all.
    pub fn require_runnable(&self, platforms: &[Platform]) -> AppResult<()> {
        if self.apify_token.trim().len() < MIN_TOKEN_LEN {
            return Err(AppError::Configuration(
                "Scraper token is missing or invalid; set apify_token first".to_string(),
            ));
        }
        let mut missing = Vec::new();
        for platform in platforms {
            for content_type in ContentType::ALL {
                if self.actor(*platform, content_type).is_none() {
                    missing.push(ConfigKey::Actor(*platform, content_type).name());
                }
            }
        }
        if !missing.is_empty() {
            return Err(AppError::Configuration(format!(
                "Missing scraper actor ids: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn apply(&mut self, key: ConfigKey, value: ConfigValue) {
        match (key, value) {
            (ConfigKey::ApifyToken, ConfigValue::String(v)) => self.apify_token = v,
            (ConfigKey::HuggingfaceModel, ConfigValue::String(v)) => self.huggingface_model = v,
            (ConfigKey::Actor(platform, content_type), ConfigValue::String(v)) => {
                self.actors.insert((platform, content_type), v);
            }
            (ConfigKey::KeywordsPositive, ConfigValue::StringList(v)) => self.keywords_positive = v,
            (ConfigKey::KeywordsNegative, ConfigValue::StringList(v)) => self.keywords_negative = v,
            (ConfigKey::DefaultLimitPosts, ConfigValue::Integer(v)) => self.default_limit_posts = v,
            (ConfigKey::DefaultLimitComments, ConfigValue::Integer(v)) => {
                self.default_limit_comments = v
            }
            _ => {}
        }
    }
}

/// One entry as exposed over HTTP, secrets masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigView {
    pub key: String,
    pub value: ConfigValue,
    pub value_type: ConfigValueType,
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ConfigStore {
    db: Arc<dyn DatabaseInterface>,
}

impl ConfigStore {
    pub fn new(db: Arc<dyn DatabaseInterface>) -> Self {
        Self { db }
    }

    /// Writes defaults for keys that have never been set. Existing values are kept.
    pub async fn seed_defaults(&self) -> AppResult<usize> {
        let mut seeded = 0;
        for key in ConfigKey::all() {
            let value = key.default_value();
            if self
                .db
                .insert_config_default(&key.name(), &value.encode()?, value.value_type().as_str())
                .await?
            {
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(seeded, "seeded default configuration");
        }
        Ok(seeded)
    }

    pub async fn get(&self, key: ConfigKey) -> AppResult<ConfigValue> {
        match self.db.get_config_entry(&key.name()).await? {
            Some(entry) => decode_entry(key, &entry),
            None => Ok(key.default_value()),
        }
    }

    pub async fn set(&self, key: ConfigKey, value: ConfigValue) -> AppResult<ConfigEntry> {
        let value = key.validate(value)?;
        let entry = self
            .db
            .put_config_entry(&key.name(), &value.encode()?, value.value_type().as_str())
            .await?;
        info!(key = %key, version = entry.version, "configuration updated");
        Ok(entry)
    }

    /// Generic write used by `PUT /config/entries/{key}`.
    pub async fn set_by_name(&self, key: &str, value: ConfigValue) -> AppResult<ConfigEntry> {
        let key: ConfigKey = key.parse()?;
        self.set(key, value).await
    }

    pub async fn set_token(&self, token: &str) -> AppResult<ConfigEntry> {
        self.set(ConfigKey::ApifyToken, ConfigValue::String(token.to_string()))
            .await
    }

    pub async fn set_actor(
        &self,
        platform: Platform,
        content_type: ContentType,
        actor_id: &str,
    ) -> AppResult<ConfigEntry> {
        self.set(
            ConfigKey::Actor(platform, content_type),
            ConfigValue::String(actor_id.to_string()),
        )
        .await
    }

    pub async fn set_model(&self, model: &str) -> AppResult<ConfigEntry> {
        self.set(ConfigKey::HuggingfaceModel, ConfigValue::String(model.to_string()))
            .await
    }

    pub async fn set_keywords(
        &self,
        positive: Option<Vec<String>>,
        negative: Option<Vec<String>>,
    ) -> AppResult<Vec<ConfigEntry>> {
        let mut written = Vec::new();
        if let Some(words) = positive {
            written.push(
                self.set(ConfigKey::KeywordsPositive, ConfigValue::StringList(words))
                    .await?,
            );
        }
        if let Some(words) = negative {
            written.push(
                self.set(ConfigKey::KeywordsNegative, ConfigValue::StringList(words))
                    .await?,
            );
        }
        Ok(written)
    }

    pub async fn set_limits(
        &self,
        posts: Option<i64>,
        comments: Option<i64>,
    ) -> AppResult<Vec<ConfigEntry>> {
        let mut written = Vec::new();
        if let Some(limit) = posts {
            written.push(
                self.set(ConfigKey::DefaultLimitPosts, ConfigValue::Integer(limit))
                    .await?,
            );
        }
        if let Some(limit) = comments {
            written.push(
                self.set(ConfigKey::DefaultLimitComments, ConfigValue::Integer(limit))
                    .await?,
            );
        }
        Ok(written)
    }

    /// Reads every tunable in one query. Missing keys fall back to their defaults.
    pub async fn snapshot(&self) -> AppResult<PipelineSettings> {
        let mut settings = PipelineSettings::default();
        for entry in self.db.list_config_entries().await? {
            let Ok(key) = entry.key.parse::<ConfigKey>() else {
                continue;
            };
            settings.apply(key, decode_entry(key, &entry)?);
        }
        Ok(settings)
    }

    /// All keys in the closed set with their current values. The token is masked.
    pub async fn list_masked(&self) -> AppResult<Vec<ConfigView>> {
        let stored: HashMap<String, ConfigEntry> = self
            .db
            .list_config_entries()
            .await?
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        let mut views = Vec::new();
        for key in ConfigKey::all() {
            let (value, version, updated_at) = match stored.get(&key.name()) {
                Some(entry) => (decode_entry(key, entry)?, entry.version, Some(entry.updated_at)),
                None => (key.default_value(), 0, None),
            };
            let value = match (key.is_secret(), value) {
                (true, ConfigValue::String(secret)) => ConfigValue::String(mask_secret(&secret)),
                (_, value) => value,
            };
            views.push(ConfigView {
                key: key.name(),
                value_type: key.value_type(),
                value,
                version,
                updated_at,
            });
        }
        Ok(views)
    }
}

fn decode_entry(key: ConfigKey, entry: &ConfigEntry) -> AppResult<ConfigValue> {
    ConfigValue::decode(key.value_type(), &entry.value).map_err(|reason| {
        AppError::Configuration(format!("Stored value for {} is invalid: {}", key, reason))
    })
}
