// HTTP surface - JSON endpoints over profiles, content, runs, stats and configuration

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{
    app_state::AppState,
    error::{AppError, AppResult},
    infrastructure::{ConfigEntry, ConfigValue, ConfigView},
    pipeline::AccountUsage,
    models::{
        parse_day_end, parse_day_start, AnalysisRun, Comment, CommentFilter, ContentType, Page,
        Pagination, Platform, Post, PostFilter, Profile, RunRequest, RunSummary, SentimentLabel,
        StatsFilter,
    },
    services::{OverviewStats, RegisterProfileRequest, SentimentStats},
};

#[derive(Debug, Default, Deserialize)]
pub struct ProfilesQuery {
    pub platform: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PostsQuery {
    pub platform: Option<String>,
    pub profile_id: Option<i64>,
    pub min_interactions: Option<i64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentsQuery {
    pub platform: Option<String>,
    pub profile_id: Option<i64>,
    pub post_id: Option<i64>,
    pub sentiment: Option<String>,
    pub min_likes: Option<i64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub platform: Option<String>,
    pub profile_id: Option<i64>,
    pub post_id: Option<i64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub profile_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TokenUpdate {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ActorUpdate {
    pub platform: String,
    pub content_type: String,
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct KeywordsUpdate {
    pub positive: Option<Vec<String>>,
    pub negative: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelUpdate {
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitsUpdate {
    pub posts: Option<i64>,
    pub comments: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EntryUpdate {
    pub value: ConfigValue,
}

// Helpers for parsing query parameters

fn parse_platform(raw: Option<&str>) -> AppResult<Option<Platform>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(str::parse::<Platform>)
        .transpose()
}

fn parse_date_range(
    from: Option<&str>,
    to: Option<&str>,
) -> AppResult<(Option<chrono::DateTime<chrono::Utc>>, Option<chrono::DateTime<chrono::Utc>>)> {
    let from = from.map(parse_day_start).transpose()?;
    let to = to.map(parse_day_end).transpose()?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(AppError::BadRequest("date_from is after date_to".to_string()));
        }
    }
    Ok((from, to))
}

/// Write acknowledgement without echoing values, so the token never leaves the process.
fn written(entries: &[ConfigEntry]) -> Json<Value> {
    let keys: Vec<Value> = entries
        .iter()
        .map(|e| json!({ "key": e.key, "version": e.version, "updated_at": e.updated_at }))
        .collect();
    Json(json!({ "updated": keys }))
}

// HTTP Handlers

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "backend": state.db.backend_name(),
        "classifier": state.inference.status(),
    }))
}

pub async fn list_profiles_handler(
    State(state): State<AppState>,
    Query(params): Query<ProfilesQuery>,
) -> Result<Json<Vec<Profile>>, AppError> {
    let platform = parse_platform(params.platform.as_deref())?;
    Ok(Json(state.profiles.list(platform).await?))
}

pub async fn create_profile_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterProfileRequest>,
) -> Result<(StatusCode, Json<Profile>), AppError> {
    let profile = state.profiles.register(req).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn delete_profile_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Value>, AppError> {
    state.profiles.delete(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn list_posts_handler(
    State(state): State<AppState>,
    Query(params): Query<PostsQuery>,
) -> Result<Json<Page<Post>>, AppError> {
    let (date_from, date_to) =
        parse_date_range(params.date_from.as_deref(), params.date_to.as_deref())?;
    let filter = PostFilter {
        platform: parse_platform(params.platform.as_deref())?,
        profile_id: params.profile_id,
        post_id: None,
        min_interactions: params.min_interactions,
        date_from,
        date_to,
    };
    let page = Pagination::new(params.limit, params.offset);
    Ok(Json(state.db.query_posts(&filter, page).await?))
}

pub async fn list_comments_handler(
    State(state): State<AppState>,
    Query(params): Query<CommentsQuery>,
) -> Result<Json<Page<Comment>>, AppError> {
    let (date_from, date_to) =
        parse_date_range(params.date_from.as_deref(), params.date_to.as_deref())?;
    let sentiment = params
        .sentiment
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<SentimentLabel>)
        .transpose()?;
    let filter = CommentFilter {
        platform: parse_platform(params.platform.as_deref())?,
        profile_id: params.profile_id,
        post_id: params.post_id,
        sentiment,
        min_likes: params.min_likes,
        date_from,
        date_to,
    };
    let page = Pagination::new(params.limit, params.offset);
    Ok(Json(state.db.query_comments(&filter, page).await?))
}

pub async fn run_analysis_handler(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunSummary>, AppError> {
    Ok(Json(state.orchestrator.run(req).await?))
}

/// Account plan for the configured scraper token.
pub async fn apify_usage_handler(
    State(state): State<AppState>,
) -> Result<Json<AccountUsage>, AppError> {
    let settings = state.config_store.snapshot().await?;
    settings.require_runnable(&[])?;
    Ok(Json(state.scraper.account_usage(&settings.apify_token).await?))
}

pub async fn list_runs_handler(
    State(state): State<AppState>,
    Query(params): Query<RunsQuery>,
) -> Result<Json<Page<AnalysisRun>>, AppError> {
    let page = Pagination::new(params.limit, params.offset);
    Ok(Json(state.db.list_runs(params.profile_id, page).await?))
}

pub async fn get_run_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<AnalysisRun>, AppError> {
    match state.db.get_run(id).await? {
        Some(run) => Ok(Json(run)),
        None => Err(AppError::NotFound(format!("Run {} not found", id))),
    }
}

fn stats_filter(params: &StatsQuery) -> AppResult<StatsFilter> {
    let (date_from, date_to) =
        parse_date_range(params.date_from.as_deref(), params.date_to.as_deref())?;
    Ok(StatsFilter {
        platform: parse_platform(params.platform.as_deref())?,
        profile_id: params.profile_id,
        post_id: params.post_id,
        date_from,
        date_to,
    })
}

pub async fn sentiment_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<SentimentStats>, AppError> {
    let filter = stats_filter(&params)?;
    Ok(Json(state.stats.sentiment(&filter).await?))
}

pub async fn overview_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<OverviewStats>, AppError> {
    let filter = stats_filter(&params)?;
    Ok(Json(state.stats.overview(&filter).await?))
}

pub async fn get_config_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConfigView>>, AppError> {
    Ok(Json(state.config_store.list_masked().await?))
}

pub async fn update_token_handler(
    State(state): State<AppState>,
    Json(req): Json<TokenUpdate>,
) -> Result<Json<Value>, AppError> {
    let entry = state.config_store.set_token(req.token.trim()).await?;
    Ok(written(&[entry]))
}

pub async fn update_actor_handler(
    State(state): State<AppState>,
    Json(req): Json<ActorUpdate>,
) -> Result<Json<Value>, AppError> {
    let platform: Platform = req.platform.parse()?;
    let content_type: ContentType = req.content_type.parse()?;
    let entry = state
        .config_store
        .set_actor(platform, content_type, req.actor_id.trim())
        .await?;
    Ok(written(&[entry]))
}

pub async fn update_keywords_handler(
    State(state): State<AppState>,
    Json(req): Json<KeywordsUpdate>,
) -> Result<Json<Value>, AppError> {
    if req.positive.is_none() && req.negative.is_none() {
        return Err(AppError::BadRequest("Provide positive and/or negative keywords".to_string()));
    }
    let entries = state.config_store.set_keywords(req.positive, req.negative).await?;
    Ok(written(&entries))
}

pub async fn update_model_handler(
    State(state): State<AppState>,
    Json(req): Json<ModelUpdate>,
) -> Result<Json<Value>, AppError> {
    let entry = state.config_store.set_model(req.model.trim()).await?;
    Ok(written(&[entry]))
}

pub async fn update_limits_handler(
    State(state): State<AppState>,
    Json(req): Json<LimitsUpdate>,
) -> Result<Json<Value>, AppError> {
    if req.posts.is_none() && req.comments.is_none() {
        return Err(AppError::BadRequest("Provide posts and/or comments limit".to_string()));
    }
    let entries = state.config_store.set_limits(req.posts, req.comments).await?;
    Ok(written(&entries))
}

pub async fn update_entry_handler(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
    Json(req): Json<EntryUpdate>,
) -> Result<Json<Value>, AppError> {
    let entry = state.config_store.set_by_name(&key, req.value).await?;
    Ok(written(&[entry]))
}

// Create API router

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))

        // Profiles
        .route("/profiles", get(list_profiles_handler).post(create_profile_handler))
        .route("/profiles/{id}", axum::routing::delete(delete_profile_handler))

        // Content
        .route("/posts", get(list_posts_handler))
        .route("/comments", get(list_comments_handler))

        // Analysis runs
        .route("/analysis/run", axum::routing::post(run_analysis_handler))
        .route("/analysis/runs", get(list_runs_handler))
        .route("/analysis/runs/{id}", get(get_run_handler))

        // Stats
        .route("/stats/sentiment", get(sentiment_stats_handler))
        .route("/stats/overview", get(overview_stats_handler))

        // Configuration
        .route("/config", get(get_config_handler))
        .route("/config/token", put(update_token_handler))
        .route("/config/actor", put(update_actor_handler))
        .route("/config/keywords", put(update_keywords_handler))
        .route("/config/model", put(update_model_handler))
        .route("/config/limits", put(update_limits_handler))
        .route("/config/entries/{key}", put(update_entry_handler))

        // Scraper account
        .route("/apify/usage", get(apify_usage_handler))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
