use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Process-level settings read from the environment. Pipeline tunables (keywords, actor ids,
/// limits) live in the persisted `ConfigStore` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scraper: ScraperConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Networked backend. When absent the embedded SQLite file is used.
    pub url: Option<String>,
    pub sqlite_path: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
    pub retry_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub profile_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
                sqlite_path: env::var("SQLITE_PATH")
                    .unwrap_or_else(|_| "data/social_sentiment.db".to_string()),
                max_connections: parse_env("DB_MAX_CONNECTIONS", 10),
                acquire_timeout_secs: parse_env("DB_ACQUIRE_TIMEOUT_SECS", 8),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env("SERVER_PORT", 8000),
            },
            scraper: ScraperConfig {
                base_url: env::var("APIFY_BASE_URL")
                    .unwrap_or_else(|_| "https://api.apify.com/v2".to_string()),
                timeout_secs: parse_env("SCRAPER_TIMEOUT_SECS", 300),
                max_attempts: parse_env("SCRAPER_MAX_ATTEMPTS", 3),
            },
            inference: InferenceConfig {
                base_url: env::var("HF_INFERENCE_URL")
                    .unwrap_or_else(|_| "https://api-inference.huggingface.co/models".to_string()),
                api_token: env::var("HF_API_TOKEN").ok().filter(|t| !t.is_empty()),
                timeout_secs: parse_env("INFERENCE_TIMEOUT_SECS", 30),
                retry_cooldown_secs: parse_env("INFERENCE_RETRY_COOLDOWN_SECS", 30),
            },
            pipeline: PipelineConfig {
                profile_concurrency: parse_env("PROFILE_CONCURRENCY", 2).max(1),
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ScraperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
