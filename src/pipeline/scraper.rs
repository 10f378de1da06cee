// Scraping service client. Actors are started, long-polled until they finish, and their dataset
// is returned as raw JSON records for normalization.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::ScraperConfig;
use crate::error::AppError;
use crate::models::{ContentType, Platform};

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Run failed with status: {0}")]
    RunFailed(String),

    #[error("Scrape timed out after {0:?}")]
    Timeout(Duration),
}

impl ScraperError {
    fn is_retryable(&self) -> bool {
        match self {
            ScraperError::Network(_) => true,
            ScraperError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ScraperError {
    fn from(err: reqwest::Error) -> Self {
        ScraperError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ScraperError {
    fn from(err: serde_json::Error) -> Self {
        ScraperError::Parse(err.to_string())
    }
}

impl From<ScraperError> for AppError {
    fn from(err: ScraperError) -> Self {
        AppError::ExternalService(err.to_string())
    }
}

/// Runs one actor to completion and returns its dataset items.
#[async_trait]
pub trait ScraperClient: Send + Sync {
    async fn run_actor(
        &self,
        token: &str,
        actor_id: &str,
        input: Value,
    ) -> Result<Vec<Value>, ScraperError>;

    /// Account and plan details for the token's owner.
    async fn account_usage(&self, token: &str) -> Result<AccountUsage, ScraperError>;
}

pub const USAGE_CONSOLE_URL: &str = "https://console.apify.com/account/usage";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountUsage {
    pub username: Option<String>,
    pub plan: String,
    pub usage_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Value>,
}

impl AccountUsage {
    /// Reads the `data` object of `GET /users/me`. A missing plan means the free tier.
    pub fn from_user(user: &Value) -> Self {
        let plan = user
            .pointer("/plan/name")
            .or_else(|| user.pointer("/plan/id"))
            .and_then(Value::as_str)
            .unwrap_or("Free")
            .to_string();
        Self {
            username: user.get("username").and_then(Value::as_str).map(str::to_string),
            plan,
            usage_url: USAGE_CONSOLE_URL.to_string(),
            limits: user.get("limits").filter(|v| !v.is_null()).cloned(),
        }
    }
}

/// One external scrape job: which actor to run and with what input.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeJob {
    pub platform: Platform,
    pub content_type: ContentType,
    pub actor_id: String,
    pub input: Value,
}

impl ScrapeJob {
    /// Posts of a profile. TikTok actors also return up to `comment_limit` comments per post.
    pub fn posts(
        platform: Platform,
        actor_id: &str,
        handle: &str,
        post_limit: i64,
        comment_limit: i64,
    ) -> Self {
        let input = match platform {
            Platform::Instagram => json!({
                "directUrls": [format!("https://www.instagram.com/{}/", handle)],
                "resultsType": "posts",
                "resultsLimit": post_limit,
            }),
            Platform::Tiktok => json!({
                "profiles": [format!("@{}", handle)],
                "profileScrapeSections": ["videos"],
                "profileSorting": "latest",
                "resultsPerPage": post_limit,
                "commentsPerPost": comment_limit,
                "excludePinnedPosts": false,
                "shouldDownloadVideos": false,
                "shouldDownloadCovers": false,
            }),
            Platform::Facebook => json!({
                "startUrls": [{ "url": format!("https://facebook.com/{}", handle) }],
                "resultsLimit": post_limit,
            }),
        };
        Self {
            platform,
            content_type: ContentType::Posts,
            actor_id: actor_id.to_string(),
            input,
        }
    }

    /// Comments of a single post, addressed by its URL.
    pub fn comments(platform: Platform, actor_id: &str, post_url: &str, limit: i64) -> Self {
        let input = match platform {
            Platform::Instagram => json!({
                "directUrls": [post_url],
                "resultsType": "comments",
                "resultsLimit": limit,
            }),
            Platform::Tiktok => json!({
                "postURLs": [post_url],
                "commentsPerPost": limit,
                "maxComments": limit,
            }),
            Platform::Facebook => json!({
                "startUrls": [{ "url": post_url }],
                "resultsLimit": limit,
                "includeNestedComments": false,
                "viewOption": "RANKED_UNFILTERED",
            }),
        };
        Self {
            platform,
            content_type: ContentType::Comments,
            actor_id: actor_id.to_string(),
            input,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RunData {
    id: String,
    status: String,
    #[serde(rename = "defaultDatasetId")]
    default_dataset_id: String,
}

/// HTTP client for the Apify v2 API.
pub struct ApifyClient {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
}

impl ApifyClient {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Actor names like `apify/facebook-posts-scraper` are addressed as `apify~facebook-posts-scraper`.
    fn actor_path(actor_id: &str) -> String {
        actor_id.replace('/', "~")
    }

    async fn start_run(&self, token: &str, actor_id: &str, input: &Value) -> Result<RunData, ScraperError> {
        let url = format!("{}/acts/{}/runs", self.base_url, Self::actor_path(actor_id));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(input)
            .send()
            .await?;
        let api_resp: ApiResponse<RunData> = Self::read_json(resp).await?;
        Ok(api_resp.data)
    }

    /// Poll until a run completes. Uses `waitForFinish=60` for efficient long-polling.
    async fn wait_for_run(&self, token: &str, run_id: &str) -> Result<RunData, ScraperError> {
        loop {
            let url = format!("{}/actor-runs/{}?waitForFinish=60", self.base_url, run_id);
            let resp = self.client.get(&url).bearer_auth(token).send().await?;
            let api_resp: ApiResponse<RunData> = Self::read_json(resp).await?;
            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(ScraperError::RunFailed(api_resp.data.status));
                }
                _ => {
                    tracing::debug!(run_id, status = %api_resp.data.status, "Run still in progress");
                }
            }
        }
    }

    async fn get_dataset_items(&self, token: &str, dataset_id: &str) -> Result<Vec<Value>, ScraperError> {
        let url = format!("{}/datasets/{}/items?format=json", self.base_url, dataset_id);
        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        Self::read_json(resp).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ScraperError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScraperError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn run_once(&self, token: &str, actor_id: &str, input: &Value) -> Result<Vec<Value>, ScraperError> {
        let run = self.start_run(token, actor_id, input).await?;
        tracing::info!(actor_id, run_id = %run.id, "Apify run started, polling for completion");

        let completed = self.wait_for_run(token, &run.id).await?;
        tracing::info!(
            run_id = %completed.id,
            dataset_id = %completed.default_dataset_id,
            "Run completed, fetching results"
        );

        let items = self.get_dataset_items(token, &completed.default_dataset_id).await?;
        tracing::info!(actor_id, count = items.len(), "Fetched dataset items");
        Ok(items)
    }
}

/// Exponential backoff from 500ms with up to 250ms of jitter.
fn backoff(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::rng().random_range(0..250u64);
    Duration::from_millis(base + jitter)
}

#[async_trait]
impl ScraperClient for ApifyClient {
    async fn run_actor(
        &self,
        token: &str,
        actor_id: &str,
        input: Value,
    ) -> Result<Vec<Value>, ScraperError> {
        let mut attempt = 0;
        loop {
            match self.run_once(token, actor_id, &input).await {
                Ok(items) => return Ok(items),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = backoff(attempt);
                    tracing::warn!(actor_id, attempt, ?delay, error = %err, "Scrape failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn account_usage(&self, token: &str) -> Result<AccountUsage, ScraperError> {
        let url = format!("{}/users/me", self.base_url);
        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        let api_resp: ApiResponse<Value> = Self::read_json(resp).await?;
        Ok(AccountUsage::from_user(&api_resp.data))
    }
}
