// Shared fixtures: fake scraper and inference collaborators, and storage backends under test.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use chrono::{DateTime, Utc};
use social_sentiment::{
    app_state::AppState,
    config::{Config, DatabaseConfig, InferenceConfig, PipelineConfig, ScraperConfig, ServerConfig},
    error::{AppError, AppResult},
    infrastructure::{ConfigEntry, DatabaseInterface, PostgresDatabase, SqliteDatabase},
    models::{
        AnalysisRun, Comment, CommentFilter, NewComment, NewPost, NewProfile, OverviewCounts, Page,
        Pagination, Platform, Post, PostBatchOutcome, PostFilter, Profile, ProfileFilter,
        RunCounts, RunStatus, Sentiment, SentimentCount, StatsFilter,
    },
    pipeline::{AccountUsage, ScraperClient, ScraperError},
    sentiment::{InferenceBackend, InferenceError, InferenceHandle, InferenceLoader, Prediction},
};

pub const TEST_TOKEN: &str = "apify_test_token_0123456789";

/// Serves canned datasets keyed by the job's target (profile or post URL).
#[derive(Default)]
pub struct FakeScraper {
    responses: Mutex<HashMap<String, Result<Vec<Value>, String>>>,
    calls: Mutex<Vec<(String, String)>>,
    usage_tokens: Mutex<Vec<String>>,
}

/// The first URL or handle a job addresses, whatever the platform's input shape.
pub fn job_target(input: &Value) -> String {
    let candidates = [
        &input["directUrls"][0],
        &input["profiles"][0],
        &input["postURLs"][0],
        &input["startUrls"][0]["url"],
    ];
    candidates
        .iter()
        .find_map(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl FakeScraper {
    pub fn respond(&self, target: &str, records: Vec<Value>) {
        self.responses
            .lock()
            .unwrap()
            .insert(target.to_string(), Ok(records));
    }

    pub fn fail(&self, target: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(target.to_string(), Err(message.to_string()));
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t == target)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn usage_tokens(&self) -> Vec<String> {
        self.usage_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScraperClient for FakeScraper {
    async fn run_actor(
        &self,
        _token: &str,
        actor_id: &str,
        input: Value,
    ) -> Result<Vec<Value>, ScraperError> {
        let target = job_target(&input);
        self.calls
            .lock()
            .unwrap()
            .push((actor_id.to_string(), target.clone()));
        match self.responses.lock().unwrap().get(&target) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(message)) => Err(ScraperError::Api {
                status: 400,
                message: message.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn account_usage(&self, token: &str) -> Result<AccountUsage, ScraperError> {
        self.usage_tokens.lock().unwrap().push(token.to_string());
        Ok(AccountUsage::from_user(&json!({
            "username": "analyst",
            "plan": { "name": "Starter" },
            "limits": { "maxMonthlyUsageUsd": 49 }
        })))
    }
}

/// Answers every text with a fixed label once `available` is set.
pub struct FakeLoader {
    pub available: AtomicBool,
    pub loads: AtomicUsize,
    pub label: String,
    pub score: f64,
}

impl FakeLoader {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            loads: AtomicUsize::new(0),
            label: "LABEL_1".to_string(),
            score: 0.66,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

struct FakeBackend {
    model: String,
    label: String,
    score: f64,
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn predict(&self, _text: &str) -> Result<Prediction, InferenceError> {
        Ok(Prediction {
            label: self.label.clone(),
            score: self.score,
        })
    }
}

#[async_trait]
impl InferenceLoader for FakeLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(InferenceError::Load {
                model: model_id.to_string(),
                message: "model weights unavailable".to_string(),
            });
        }
        Ok(Arc::new(FakeBackend {
            model: model_id.to_string(),
            label: self.label.clone(),
            score: self.score,
        }))
    }
}

pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            url: None,
            sqlite_path: String::new(),
            max_connections: 5,
            acquire_timeout_secs: 5,
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        scraper: ScraperConfig {
            base_url: "http://scraper.invalid".to_string(),
            timeout_secs: 5,
            max_attempts: 1,
        },
        inference: InferenceConfig {
            base_url: "http://inference.invalid".to_string(),
            api_token: None,
            timeout_secs: 5,
            retry_cooldown_secs: 0,
        },
        pipeline: PipelineConfig {
            profile_concurrency: 2,
        },
    }
}

/// An application wired around an in-memory store and fake collaborators.
pub struct Harness {
    pub state: AppState,
    pub db: Arc<dyn DatabaseInterface>,
    pub scraper: Arc<FakeScraper>,
    pub loader: Arc<FakeLoader>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_loader(FakeLoader::new(true)).await
    }

    pub async fn with_loader(loader: FakeLoader) -> Self {
        let db: Arc<dyn DatabaseInterface> =
            Arc::new(SqliteDatabase::new_in_memory().await.unwrap());
        Self::over(db, loader).await
    }

    pub async fn over(db: Arc<dyn DatabaseInterface>, loader: FakeLoader) -> Self {
        let scraper = Arc::new(FakeScraper::default());
        let loader = Arc::new(loader);
        // Zero cooldown: every run may retry a failed model load.
        let inference = Arc::new(InferenceHandle::new(
            loader.clone(),
            Duration::ZERO,
            Duration::from_secs(5),
        ));

        let state = AppState::from_parts(&test_config(), db.clone(), scraper.clone(), inference);
        state.config_store.seed_defaults().await.unwrap();
        state.config_store.set_token(TEST_TOKEN).await.unwrap();

        Self {
            state,
            db,
            scraper,
            loader,
        }
    }

    pub async fn profile(&self, platform: Platform, handle: &str) -> Profile {
        self.db
            .upsert_profile(NewProfile {
                platform,
                handle: handle.to_string(),
                display_name: None,
            })
            .await
            .unwrap()
    }
}

/// Passes everything through except post writes, which fail like a lost database connection.
pub struct PostWritesFailing {
    pub inner: Arc<dyn DatabaseInterface>,
}

#[async_trait]
impl DatabaseInterface for PostWritesFailing {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn health_check(&self) -> AppResult<()> {
        self.inner.health_check().await
    }

    async fn upsert_profile(&self, profile: NewProfile) -> AppResult<Profile> {
        self.inner.upsert_profile(profile).await
    }

    async fn get_profiles(&self, filter: &ProfileFilter) -> AppResult<Vec<Profile>> {
        self.inner.get_profiles(filter).await
    }

    async fn delete_profile(&self, profile_id: i64) -> AppResult<bool> {
        self.inner.delete_profile(profile_id).await
    }

    async fn mark_profile_analyzed(&self, profile_id: i64, at: DateTime<Utc>) -> AppResult<()> {
        self.inner.mark_profile_analyzed(profile_id, at).await
    }

    async fn insert_posts_if_absent(
        &self,
        _profile_id: i64,
        _posts: &[NewPost],
    ) -> AppResult<PostBatchOutcome> {
        Err(AppError::Storage("connection reset by peer".to_string()))
    }

    async fn insert_comments_if_absent(
        &self,
        post_id: i64,
        comments: &[NewComment],
    ) -> AppResult<Vec<Comment>> {
        self.inner.insert_comments_if_absent(post_id, comments).await
    }

    async fn update_comment_sentiment(
        &self,
        comment_id: i64,
        sentiment: &Sentiment,
    ) -> AppResult<bool> {
        self.inner.update_comment_sentiment(comment_id, sentiment).await
    }

    async fn unclassified_comments(&self, profile_id: i64, limit: i64) -> AppResult<Vec<Comment>> {
        self.inner.unclassified_comments(profile_id, limit).await
    }

    async fn query_posts(&self, filter: &PostFilter, page: Pagination) -> AppResult<Page<Post>> {
        self.inner.query_posts(filter, page).await
    }

    async fn query_comments(
        &self,
        filter: &CommentFilter,
        page: Pagination,
    ) -> AppResult<Page<Comment>> {
        self.inner.query_comments(filter, page).await
    }

    async fn aggregate_sentiment_counts(
        &self,
        filter: &StatsFilter,
    ) -> AppResult<Vec<SentimentCount>> {
        self.inner.aggregate_sentiment_counts(filter).await
    }

    async fn aggregate_overview(&self, filter: &StatsFilter) -> AppResult<OverviewCounts> {
        self.inner.aggregate_overview(filter).await
    }

    async fn begin_run(&self, profile_ids: &[i64], force: bool) -> AppResult<AnalysisRun> {
        self.inner.begin_run(profile_ids, force).await
    }

    async fn complete_run(
        &self,
        run_id: i64,
        counts: RunCounts,
        status: RunStatus,
    ) -> AppResult<AnalysisRun> {
        self.inner.complete_run(run_id, counts, status).await
    }

    async fn get_run(&self, run_id: i64) -> AppResult<Option<AnalysisRun>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(
        &self,
        profile_id: Option<i64>,
        page: Pagination,
    ) -> AppResult<Page<AnalysisRun>> {
        self.inner.list_runs(profile_id, page).await
    }

    async fn get_config_entry(&self, key: &str) -> AppResult<Option<ConfigEntry>> {
        self.inner.get_config_entry(key).await
    }

    async fn list_config_entries(&self) -> AppResult<Vec<ConfigEntry>> {
        self.inner.list_config_entries().await
    }

    async fn put_config_entry(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<ConfigEntry> {
        self.inner.put_config_entry(key, value, value_type).await
    }

    async fn insert_config_default(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<bool> {
        self.inner.insert_config_default(key, value, value_type).await
    }
}

pub fn instagram_profile_url(handle: &str) -> String {
    format!("https://www.instagram.com/{}/", handle)
}

pub fn instagram_post(id: &str, likes: i64, comments: Vec<Value>) -> Value {
    json!({
        "id": id,
        "url": format!("https://www.instagram.com/p/{}/", id),
        "caption": format!("post {}", id),
        "likesCount": likes,
        "commentsCount": comments.len(),
        "timestamp": "2024-02-13T20:49:57.000Z",
        "latestComments": comments,
    })
}

pub fn comment(id: &str, text: &str) -> Value {
    json!({ "id": id, "text": text, "ownerUsername": "fan", "likesCount": 1 })
}

// Storage backends for the conformance suite

static POSTGRES_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

pub struct Backend {
    pub name: &'static str,
    pub db: Arc<dyn DatabaseInterface>,
    _dir: Option<TempDir>,
    _guard: Option<tokio::sync::MutexGuard<'static, ()>>,
}

/// Fresh, empty instances of every available backend. PostgreSQL joins when
/// `TEST_DATABASE_URL` is set; its cases are serialized since they share one database.
pub async fn backends() -> Vec<Backend> {
    let mut backends = vec![Backend {
        name: "sqlite-memory",
        db: Arc::new(SqliteDatabase::new_in_memory().await.unwrap()),
        _dir: None,
        _guard: None,
    }];

    let dir = TempDir::new().unwrap();
    let file_db = SqliteDatabase::open(dir.path().join("conformance.db"))
        .await
        .unwrap();
    backends.push(Backend {
        name: "sqlite-file",
        db: Arc::new(file_db),
        _dir: Some(dir),
        _guard: None,
    });

    if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
        let guard = POSTGRES_LOCK.lock().await;
        let postgres = PostgresDatabase::connect(&url, &test_config().database)
            .await
            .unwrap();
        postgres.initialize().await.unwrap();
        postgres.truncate_all().await.unwrap();
        backends.push(Backend {
            name: "postgres",
            db: Arc::new(postgres),
            _dir: None,
            _guard: Some(guard),
        });
    }
    backends
}
