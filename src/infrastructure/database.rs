// Database Interface - the persistence contract shared by the PostgreSQL and SQLite backends
// Uniqueness, run exclusivity and cascades are enforced by the schema, not by callers.

use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use crate::infrastructure::config_store::ConfigEntry;
use crate::infrastructure::filters::{
    push_comment_conditions, push_post_conditions, push_profile_conditions,
};
use crate::infrastructure::rows::{
    comment_from_row, complete_sentiment_counts, config_entry_from_row, platform_count_from_row,
    post_from_row, profile_from_row, run_from_row, sentiment_group_from_row, COMMENT_COLUMNS,
    COMMENT_COLUMNS_C, CONFIG_COLUMNS, POST_COLUMNS, POST_COLUMNS_P, PROFILE_COLUMNS, RUN_COLUMNS,
};
use crate::infrastructure::sqlite_database::SqliteDatabase;
use crate::models::{
    current_time_millis, to_millis, AnalysisRun, Comment, CommentFilter, NewComment, NewPost,
    NewProfile, OverviewCounts, Page, Pagination, Platform, PlatformTotals, Post,
    PostBatchOutcome, PostFilter, Profile, ProfileFilter, RunCounts, RunStatus, Sentiment,
    SentimentCount, StatsFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Storage contract. Both implementations must behave identically; the conformance suite in
/// `tests/storage_conformance.rs` runs against each of them.
#[async_trait]
pub trait DatabaseInterface: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> AppResult<()>;

    // Profiles

    /// Inserts the profile, or returns the existing one for the same (platform, handle).
    async fn upsert_profile(&self, profile: NewProfile) -> AppResult<Profile>;

    async fn get_profiles(&self, filter: &ProfileFilter) -> AppResult<Vec<Profile>>;

    /// Removes the profile with its posts, comments and claims. Runs left without any targeted
    /// profile are removed as well. Returns false when the profile did not exist, and fails with
    /// `RunConflict` while an unfinished run holds the profile's claim.
    async fn delete_profile(&self, profile_id: i64) -> AppResult<bool>;

    async fn mark_profile_analyzed(&self, profile_id: i64, at: DateTime<Utc>) -> AppResult<()>;

    // Content

    /// Inserts posts whose (platform, native id) is unknown. Known posts only get their counters
    /// refreshed and come back in `refreshed`.
    async fn insert_posts_if_absent(
        &self,
        profile_id: i64,
        posts: &[NewPost],
    ) -> AppResult<PostBatchOutcome>;

    /// Returns only the comments that were actually inserted, in input order.
    async fn insert_comments_if_absent(
        &self,
        post_id: i64,
        comments: &[NewComment],
    ) -> AppResult<Vec<Comment>>;

    /// Transitions an UNCLASSIFIED comment. Returns false if it was already classified.
    async fn update_comment_sentiment(
        &self,
        comment_id: i64,
        sentiment: &Sentiment,
    ) -> AppResult<bool>;

    /// Comments of a profile still waiting for a label, oldest first.
    async fn unclassified_comments(&self, profile_id: i64, limit: i64) -> AppResult<Vec<Comment>>;

    async fn query_posts(&self, filter: &PostFilter, page: Pagination) -> AppResult<Page<Post>>;

    async fn query_comments(
        &self,
        filter: &CommentFilter,
        page: Pagination,
    ) -> AppResult<Page<Comment>>;

    // Aggregates

    async fn aggregate_sentiment_counts(&self, filter: &StatsFilter)
        -> AppResult<Vec<SentimentCount>>;

    /// All overview numbers read from a single snapshot.
    async fn aggregate_overview(&self, filter: &StatsFilter) -> AppResult<OverviewCounts>;

    // Runs

    /// Creates a running run and claims every profile for it. Fails with `RunConflict` listing the
    /// contested profiles unless `force` is set, in which case claims are taken over and the
    /// previous owners are marked as superseded.
    async fn begin_run(&self, profile_ids: &[i64], force: bool) -> AppResult<AnalysisRun>;

    /// Finishes a running run and releases the claims it still owns.
    async fn complete_run(
        &self,
        run_id: i64,
        counts: RunCounts,
        status: RunStatus,
    ) -> AppResult<AnalysisRun>;

    async fn get_run(&self, run_id: i64) -> AppResult<Option<AnalysisRun>>;

    async fn list_runs(
        &self,
        profile_id: Option<i64>,
        page: Pagination,
    ) -> AppResult<Page<AnalysisRun>>;

    // Config entries

    async fn get_config_entry(&self, key: &str) -> AppResult<Option<ConfigEntry>>;

    async fn list_config_entries(&self) -> AppResult<Vec<ConfigEntry>>;

    /// Writes the value and bumps the entry version.
    async fn put_config_entry(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<ConfigEntry>;

    /// Inserts only when the key is absent. Returns whether a row was written.
    async fn insert_config_default(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<bool>;
}

/// Schema for the networked backend. Timestamps are epoch milliseconds.
const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS config_entries (
        key VARCHAR(64) PRIMARY KEY,
        value TEXT NOT NULL,
        value_type VARCHAR(32) NOT NULL,
        version BIGINT NOT NULL DEFAULT 1,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id BIGSERIAL PRIMARY KEY,
        platform VARCHAR(32) NOT NULL,
        handle VARCHAR(255) NOT NULL,
        display_name VARCHAR(255),
        last_analyzed_at BIGINT,
        created_at BIGINT NOT NULL,
        UNIQUE (platform, handle)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS posts (
        id BIGSERIAL PRIMARY KEY,
        profile_id BIGINT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        platform VARCHAR(32) NOT NULL,
        native_id VARCHAR(255) NOT NULL,
        url TEXT,
        text TEXT,
        likes BIGINT NOT NULL DEFAULT 0,
        comments_count BIGINT NOT NULL DEFAULT 0,
        shares BIGINT NOT NULL DEFAULT 0,
        views BIGINT NOT NULL DEFAULT 0,
        interactions_total BIGINT NOT NULL DEFAULT 0,
        posted_at BIGINT,
        scraped_at BIGINT NOT NULL,
        UNIQUE (platform, native_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        id BIGSERIAL PRIMARY KEY,
        post_id BIGINT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        native_id VARCHAR(255) NOT NULL,
        author VARCHAR(255),
        text TEXT,
        likes BIGINT NOT NULL DEFAULT 0,
        posted_at BIGINT,
        scraped_at BIGINT NOT NULL,
        sentiment_label VARCHAR(16) NOT NULL DEFAULT 'UNCLASSIFIED',
        sentiment_confidence DOUBLE PRECISION,
        classification_source VARCHAR(16),
        classified_at BIGINT,
        UNIQUE (post_id, native_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_runs (
        id BIGSERIAL PRIMARY KEY,
        status VARCHAR(16) NOT NULL,
        forced BOOLEAN NOT NULL DEFAULT FALSE,
        started_at BIGINT NOT NULL,
        finished_at BIGINT,
        new_posts BIGINT NOT NULL DEFAULT 0,
        new_comments BIGINT NOT NULL DEFAULT 0,
        classified_comments BIGINT NOT NULL DEFAULT 0,
        failed_items BIGINT NOT NULL DEFAULT 0,
        superseded_by BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_profiles (
        run_id BIGINT NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
        profile_id BIGINT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        PRIMARY KEY (run_id, profile_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profile_claims (
        profile_id BIGINT PRIMARY KEY REFERENCES profiles(id) ON DELETE CASCADE,
        run_id BIGINT NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
        claimed_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_posts_profile ON posts(profile_id, posted_at)",
    "CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id)",
    "CREATE INDEX IF NOT EXISTS idx_comments_sentiment ON comments(sentiment_label)",
    "CREATE INDEX IF NOT EXISTS idx_run_profiles_profile ON run_profiles(profile_id)",
    "CREATE INDEX IF NOT EXISTS idx_profile_claims_run ON profile_claims(run_id)",
];

/// PostgreSQL implementation of the storage contract
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, config: &DatabaseConfig) -> AppResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(std::time::Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to connect to database: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Creates missing tables and indexes. Existing data is left untouched.
    pub async fn initialize(&self) -> AppResult<()> {
        for statement in POSTGRES_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to create schema: {}", e)))?;
        }
        info!(backend = "postgres", "database schema ready");
        Ok(())
    }

    /// Empties every table. Used by the conformance suite between cases.
    pub async fn truncate_all(&self) -> AppResult<()> {
        sqlx::query(
            "TRUNCATE profile_claims, run_profiles, analysis_runs, comments, posts, profiles, \
             config_entries RESTART IDENTITY CASCADE",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to truncate tables: {}", e)))?;
        Ok(())
    }

    async fn run_profile_ids(&self, run_ids: &[i64]) -> AppResult<BTreeMap<i64, Vec<i64>>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT run_id, profile_id FROM run_profiles WHERE run_id = ANY($1) \
             ORDER BY run_id, profile_id",
        )
        .bind(run_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to load run profiles: {}", e)))?;

        let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (run_id, profile_id) in rows {
            grouped.entry(run_id).or_default().push(profile_id);
        }
        Ok(grouped)
    }

    async fn sentiment_counts_in(
        tx: &mut Transaction<'_, Postgres>,
        filter: &CommentFilter,
    ) -> AppResult<Vec<SentimentCount>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT c.sentiment_label AS label, COUNT(*) AS count, \
             AVG(c.sentiment_confidence) AS avg_confidence \
             FROM comments c JOIN posts p ON c.post_id = p.id",
        );
        push_comment_conditions(&mut qb, filter);
        qb.push(" GROUP BY c.sentiment_label");

        let rows = qb
            .build()
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to aggregate sentiment: {}", e)))?;
        let grouped = rows
            .iter()
            .map(sentiment_group_from_row::<PgRow>)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(complete_sentiment_counts(grouped))
    }
}

#[async_trait]
impl DatabaseInterface for PostgresDatabase {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    /// Health check to verify database connectivity
    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Database health check failed: {}", e)))?;
        Ok(())
    }

    async fn upsert_profile(&self, profile: NewProfile) -> AppResult<Profile> {
        let sql = format!(
            "INSERT INTO profiles (platform, handle, display_name, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (platform, handle) DO UPDATE \
             SET display_name = COALESCE(EXCLUDED.display_name, profiles.display_name) \
             RETURNING {}",
            PROFILE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(profile.platform.as_str())
            .bind(&profile.handle)
            .bind(&profile.display_name)
            .bind(current_time_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to upsert profile: {}", e)))?;
        profile_from_row(&row)
    }

    async fn get_profiles(&self, filter: &ProfileFilter) -> AppResult<Vec<Profile>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM profiles pr",
            PROFILE_COLUMNS
        ));
        push_profile_conditions(&mut qb, filter);
        qb.push(" ORDER BY pr.platform, pr.handle");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to query profiles: {}", e)))?;
        rows.iter().map(profile_from_row::<PgRow>).collect()
    }

    async fn delete_profile(&self, profile_id: i64) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;

        // Row lock conflicts with the key-share lock a claim insert takes on the profile.
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM profiles WHERE id = $1 FOR UPDATE")
            .bind(profile_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to lock profile: {}", e)))?;
        if exists.is_none() {
            tx.rollback()
                .await
                .map_err(|e| AppError::Storage(format!("Failed to roll back: {}", e)))?;
            return Ok(false);
        }

        let claimed: Option<i64> =
            sqlx::query_scalar("SELECT run_id FROM profile_claims WHERE profile_id = $1")
                .bind(profile_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to load claim: {}", e)))?;
        if let Some(run_id) = claimed {
            tx.rollback()
                .await
                .map_err(|e| AppError::Storage(format!("Failed to roll back: {}", e)))?;
            warn!(profile_id, run_id, "refusing to delete a profile claimed by a running run");
            return Err(AppError::RunConflict {
                profile_ids: vec![profile_id],
            });
        }

        let run_ids: Vec<i64> =
            sqlx::query_scalar("SELECT run_id FROM run_profiles WHERE profile_id = $1")
                .bind(profile_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to load profile runs: {}", e)))?;

        let deleted = sqlx::query("DELETE FROM profiles WHERE id = $1")
            .bind(profile_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to delete profile: {}", e)))?
            .rows_affected();

        sqlx::query(
            "DELETE FROM analysis_runs r WHERE r.id = ANY($1) \
             AND NOT EXISTS (SELECT 1 FROM run_profiles rp WHERE rp.run_id = r.id)",
        )
        .bind(&run_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to delete orphaned runs: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit profile delete: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn mark_profile_analyzed(&self, profile_id: i64, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE profiles SET last_analyzed_at = $1 WHERE id = $2")
            .bind(to_millis(at))
            .bind(profile_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to mark profile analyzed: {}", e)))?;
        Ok(())
    }

    async fn insert_posts_if_absent(
        &self,
        profile_id: i64,
        posts: &[NewPost],
    ) -> AppResult<PostBatchOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let platform: Option<String> =
            sqlx::query_scalar("SELECT platform FROM profiles WHERE id = $1")
                .bind(profile_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to load profile: {}", e)))?;
        let platform = platform
            .ok_or_else(|| AppError::NotFound(format!("Profile {} not found", profile_id)))?;

        let insert_sql = format!(
            "INSERT INTO posts (profile_id, platform, native_id, url, text, likes, comments_count, \
             shares, views, interactions_total, posted_at, scraped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (platform, native_id) DO NOTHING RETURNING {}",
            POST_COLUMNS
        );
        let refresh_sql = format!(
            "UPDATE posts SET likes = $1, comments_count = $2, shares = $3, views = $4, \
             interactions_total = $5, scraped_at = $6 \
             WHERE platform = $7 AND native_id = $8 RETURNING {}",
            POST_COLUMNS
        );

        let now = current_time_millis();
        let mut outcome = PostBatchOutcome::default();
        for post in posts {
            let inserted = sqlx::query(&insert_sql)
                .bind(profile_id)
                .bind(&platform)
                .bind(&post.native_id)
                .bind(&post.url)
                .bind(&post.text)
                .bind(post.likes)
                .bind(post.comments_count)
                .bind(post.shares)
                .bind(post.views)
                .bind(post.interactions_total())
                .bind(post.posted_at.map(to_millis))
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to insert post: {}", e)))?;

            match inserted {
                Some(row) => outcome.inserted.push(post_from_row(&row)?),
                None => {
                    let row = sqlx::query(&refresh_sql)
                        .bind(post.likes)
                        .bind(post.comments_count)
                        .bind(post.shares)
                        .bind(post.views)
                        .bind(post.interactions_total())
                        .bind(now)
                        .bind(&platform)
                        .bind(&post.native_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| {
                            AppError::Storage(format!("Failed to refresh post counters: {}", e))
                        })?;
                    outcome.refreshed.push(post_from_row(&row)?);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit posts: {}", e)))?;
        Ok(outcome)
    }

    async fn insert_comments_if_absent(
        &self,
        post_id: i64,
        comments: &[NewComment],
    ) -> AppResult<Vec<Comment>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let sql = format!(
            "INSERT INTO comments (post_id, native_id, author, text, likes, posted_at, scraped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (post_id, native_id) DO NOTHING RETURNING {}",
            COMMENT_COLUMNS
        );

        let now = current_time_millis();
        let mut inserted = Vec::new();
        for comment in comments {
            let row = sqlx::query(&sql)
                .bind(post_id)
                .bind(&comment.native_id)
                .bind(&comment.author)
                .bind(&comment.text)
                .bind(comment.likes)
                .bind(comment.posted_at.map(to_millis))
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to insert comment: {}", e)))?;
            if let Some(row) = row {
                inserted.push(comment_from_row(&row)?);
            }
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit comments: {}", e)))?;
        Ok(inserted)
    }

    async fn update_comment_sentiment(
        &self,
        comment_id: i64,
        sentiment: &Sentiment,
    ) -> AppResult<bool> {
        if !sentiment.label.is_classified() {
            return Err(AppError::Validation(
                "A comment cannot be labelled UNCLASSIFIED".to_string(),
            ));
        }
        let updated = sqlx::query(
            "UPDATE comments SET sentiment_label = $1, sentiment_confidence = $2, \
             classification_source = $3, classified_at = $4 \
             WHERE id = $5 AND sentiment_label = 'UNCLASSIFIED'",
        )
        .bind(sentiment.label.as_str())
        .bind(sentiment.confidence)
        .bind(sentiment.source.as_str())
        .bind(current_time_millis())
        .bind(comment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to update comment sentiment: {}", e)))?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn unclassified_comments(&self, profile_id: i64, limit: i64) -> AppResult<Vec<Comment>> {
        let sql = format!(
            "SELECT {} FROM comments c JOIN posts p ON c.post_id = p.id \
             WHERE p.profile_id = $1 AND c.sentiment_label = 'UNCLASSIFIED' \
             ORDER BY c.id ASC LIMIT $2",
            COMMENT_COLUMNS_C
        );
        let rows = sqlx::query(&sql)
            .bind(profile_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load unclassified comments: {}", e)))?;
        rows.iter().map(comment_from_row::<PgRow>).collect()
    }

    async fn query_posts(&self, filter: &PostFilter, page: Pagination) -> AppResult<Page<Post>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM posts p", POST_COLUMNS_P));
        push_post_conditions(&mut qb, filter);
        qb.push(" ORDER BY p.posted_at DESC NULLS LAST, p.id DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to query posts: {}", e)))?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM posts p");
        push_post_conditions(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count posts: {}", e)))?;

        Ok(Page {
            data: rows.iter().map(post_from_row::<PgRow>).collect::<AppResult<_>>()?,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn query_comments(
        &self,
        filter: &CommentFilter,
        page: Pagination,
    ) -> AppResult<Page<Comment>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM comments c JOIN posts p ON c.post_id = p.id",
            COMMENT_COLUMNS_C
        ));
        push_comment_conditions(&mut qb, filter);
        qb.push(" ORDER BY c.likes DESC, c.posted_at DESC NULLS LAST, c.id ASC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to query comments: {}", e)))?;

        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM comments c JOIN posts p ON c.post_id = p.id",
        );
        push_comment_conditions(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count comments: {}", e)))?;

        Ok(Page {
            data: rows.iter().map(comment_from_row::<PgRow>).collect::<AppResult<_>>()?,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn aggregate_sentiment_counts(
        &self,
        filter: &StatsFilter,
    ) -> AppResult<Vec<SentimentCount>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let counts = Self::sentiment_counts_in(&mut tx, &filter.comment_filter()).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to close snapshot: {}", e)))?;
        Ok(counts)
    }

    async fn aggregate_overview(&self, filter: &StatsFilter) -> AppResult<OverviewCounts> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to open snapshot: {}", e)))?;

        let profile_filter = ProfileFilter {
            platform: filter.platform,
            ids: filter.profile_id.map(|id| vec![id]),
        };
        let post_filter = filter.post_filter();
        let comment_filter = filter.comment_filter();

        let mut qb = QueryBuilder::<Postgres>::new("SELECT (SELECT COUNT(*) FROM profiles pr");
        push_profile_conditions(&mut qb, &profile_filter);
        qb.push(") AS profiles, (SELECT COUNT(*) FROM posts p");
        push_post_conditions(&mut qb, &post_filter);
        qb.push(") AS posts, (SELECT CAST(COALESCE(SUM(p.interactions_total), 0) AS BIGINT) FROM posts p");
        push_post_conditions(&mut qb, &post_filter);
        qb.push(") AS interactions");
        let (profiles, posts, interactions): (i64, i64, i64) = qb
            .build_query_as()
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to aggregate totals: {}", e)))?;

        let sentiment = Self::sentiment_counts_in(&mut tx, &comment_filter).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT p.platform AS platform, COUNT(*) AS posts, \
             CAST(COALESCE(SUM(p.interactions_total), 0) AS BIGINT) AS interactions FROM posts p",
        );
        push_post_conditions(&mut qb, &post_filter);
        qb.push(" GROUP BY p.platform");
        let post_rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to aggregate platforms: {}", e)))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT p.platform AS platform, COUNT(*) AS comments \
             FROM comments c JOIN posts p ON c.post_id = p.id",
        );
        push_comment_conditions(&mut qb, &comment_filter);
        qb.push(" GROUP BY p.platform");
        let comment_rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to aggregate platforms: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to close snapshot: {}", e)))?;

        let mut post_totals = Vec::new();
        for row in &post_rows {
            let (platform, count) = platform_count_from_row::<PgRow>(row, "posts")?;
            let (_, interactions) = platform_count_from_row::<PgRow>(row, "interactions")?;
            post_totals.push((platform, count, interactions));
        }
        let comment_totals = comment_rows
            .iter()
            .map(|row| platform_count_from_row::<PgRow>(row, "comments"))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(OverviewCounts {
            profiles,
            posts,
            comments: sentiment.iter().map(|s| s.count).sum(),
            interactions,
            sentiment,
            platforms: platform_totals(&post_totals, &comment_totals),
        })
    }

    async fn begin_run(&self, profile_ids: &[i64], force: bool) -> AppResult<AnalysisRun> {
        let mut ids = profile_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let now = current_time_millis();
        let run_id: i64 = sqlx::query_scalar(
            "INSERT INTO analysis_runs (status, forced, started_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(RunStatus::Running.as_str())
        .bind(force)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to create run: {}", e)))?;

        let mut contested = Vec::new();
        for &profile_id in &ids {
            sqlx::query("INSERT INTO run_profiles (run_id, profile_id) VALUES ($1, $2)")
                .bind(run_id)
                .bind(profile_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to attach profile to run: {}", e)))?;

            let claimed = sqlx::query(
                "INSERT INTO profile_claims (profile_id, run_id, claimed_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (profile_id) DO NOTHING",
            )
            .bind(profile_id)
            .bind(run_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to claim profile: {}", e)))?
            .rows_affected();

            if claimed > 0 {
                continue;
            }
            if !force {
                contested.push(profile_id);
                continue;
            }

            let previous: i64 = sqlx::query_scalar(
                "SELECT run_id FROM profile_claims WHERE profile_id = $1 FOR UPDATE",
            )
            .bind(profile_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load claim: {}", e)))?;
            sqlx::query(
                "UPDATE analysis_runs SET superseded_by = $1 WHERE id = $2 AND superseded_by IS NULL",
            )
            .bind(run_id)
            .bind(previous)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to mark run superseded: {}", e)))?;
            sqlx::query("UPDATE profile_claims SET run_id = $1, claimed_at = $2 WHERE profile_id = $3")
                .bind(run_id)
                .bind(now)
                .bind(profile_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to take over claim: {}", e)))?;
            warn!(profile_id, previous_run = previous, run_id, "forced run took over profile claim");
        }

        if !contested.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| AppError::Storage(format!("Failed to roll back run: {}", e)))?;
            return Err(AppError::RunConflict {
                profile_ids: contested,
            });
        }

        let sql = format!("SELECT {} FROM analysis_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load run: {}", e)))?;
        let run = run_from_row(&row, ids)?;

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit run: {}", e)))?;
        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: i64,
        counts: RunCounts,
        status: RunStatus,
    ) -> AppResult<AnalysisRun> {
        if status == RunStatus::Running {
            return Err(AppError::Validation(
                "A run cannot be completed with status running".to_string(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let updated = sqlx::query(
            "UPDATE analysis_runs SET status = $1, finished_at = $2, new_posts = $3, \
             new_comments = $4, classified_comments = $5, failed_items = $6 \
             WHERE id = $7 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(current_time_millis())
        .bind(counts.new_posts)
        .bind(counts.new_comments)
        .bind(counts.classified_comments)
        .bind(counts.failed_items)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to complete run: {}", e)))?
        .rows_affected();

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| AppError::Storage(format!("Failed to roll back: {}", e)))?;
            return match self.get_run(run_id).await? {
                Some(_) => Err(AppError::Validation(format!("Run {} is already finished", run_id))),
                None => Err(AppError::NotFound(format!("Run {} not found", run_id))),
            };
        }

        sqlx::query("DELETE FROM profile_claims WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to release claims: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit run completion: {}", e)))?;

        self.get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }

    async fn get_run(&self, run_id: i64) -> AppResult<Option<AnalysisRun>> {
        let sql = format!("SELECT {} FROM analysis_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load run: {}", e)))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut profiles = self.run_profile_ids(&[run_id]).await?;
        run_from_row(&row, profiles.remove(&run_id).unwrap_or_default()).map(Some)
    }

    async fn list_runs(
        &self,
        profile_id: Option<i64>,
        page: Pagination,
    ) -> AppResult<Page<AnalysisRun>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM analysis_runs r", RUN_COLUMNS));
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM analysis_runs r");
        if let Some(profile_id) = profile_id {
            for builder in [&mut qb, &mut count] {
                builder
                    .push(" WHERE EXISTS (SELECT 1 FROM run_profiles rp WHERE rp.run_id = r.id AND rp.profile_id = ")
                    .push_bind(profile_id)
                    .push(")");
            }
        }
        qb.push(" ORDER BY r.started_at DESC, r.id DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list runs: {}", e)))?;
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count runs: {}", e)))?;

        let run_ids = rows
            .iter()
            .map(|row| sqlx::Row::try_get::<i64, _>(row, "id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut profiles = self.run_profile_ids(&run_ids).await?;

        let mut data = Vec::with_capacity(rows.len());
        for (row, run_id) in rows.iter().zip(run_ids) {
            data.push(run_from_row(row, profiles.remove(&run_id).unwrap_or_default())?);
        }
        Ok(Page {
            data,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn get_config_entry(&self, key: &str) -> AppResult<Option<ConfigEntry>> {
        let sql = format!("SELECT {} FROM config_entries WHERE key = $1", CONFIG_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read config entry: {}", e)))?;
        row.as_ref().map(config_entry_from_row::<PgRow>).transpose()
    }

    async fn list_config_entries(&self) -> AppResult<Vec<ConfigEntry>> {
        let sql = format!("SELECT {} FROM config_entries ORDER BY key", CONFIG_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list config entries: {}", e)))?;
        rows.iter().map(config_entry_from_row::<PgRow>).collect()
    }

    async fn put_config_entry(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<ConfigEntry> {
        let sql = format!(
            "INSERT INTO config_entries (key, value, value_type, version, updated_at) \
             VALUES ($1, $2, $3, 1, $4) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, \
             value_type = EXCLUDED.value_type, version = config_entries.version + 1, \
             updated_at = EXCLUDED.updated_at \
             RETURNING {}",
            CONFIG_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(value_type)
            .bind(current_time_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to write config entry: {}", e)))?;
        config_entry_from_row(&row)
    }

    async fn insert_config_default(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO config_entries (key, value, value_type, version, updated_at) \
             VALUES ($1, $2, $3, 1, $4) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(current_time_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to seed config entry: {}", e)))?
        .rows_affected();
        Ok(inserted > 0)
    }
}

/// Merges per-platform post and comment groups into one row per platform, in platform order.
pub(crate) fn platform_totals(
    posts: &[(Platform, i64, i64)],
    comments: &[(Platform, i64)],
) -> Vec<PlatformTotals> {
    Platform::ALL
        .iter()
        .filter_map(|platform| {
            let post = posts.iter().find(|(p, _, _)| p == platform);
            let comment = comments.iter().find(|(p, _)| p == platform);
            if post.is_none() && comment.is_none() {
                return None;
            }
            Some(PlatformTotals {
                platform: *platform,
                posts: post.map(|(_, count, _)| *count).unwrap_or(0),
                interactions: post.map(|(_, _, total)| *total).unwrap_or(0),
                comments: comment.map(|(_, count)| *count).unwrap_or(0),
            })
        })
        .collect()
}

/// Opens the backend selected by configuration: PostgreSQL when a URL is set, otherwise the
/// embedded SQLite file. The schema is created on first use.
pub async fn connect_database(config: &DatabaseConfig) -> AppResult<Arc<dyn DatabaseInterface>> {
    match &config.url {
        Some(url) => {
            let database = PostgresDatabase::connect(url, config).await?;
            database.initialize().await?;
            info!(
                backend = "postgres",
                max_connections = config.max_connections,
                "database connected"
            );
            Ok(Arc::new(database))
        }
        None => {
            let database = SqliteDatabase::open(&config.sqlite_path).await?;
            info!(backend = "sqlite", path = %config.sqlite_path, "database connected");
            Ok(Arc::new(database))
        }
    }
}
