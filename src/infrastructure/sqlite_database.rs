use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection, QueryBuilder, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::config_store::ConfigEntry;
use crate::infrastructure::database::{platform_totals, DatabaseInterface};
use crate::infrastructure::filters::{
    push_comment_conditions, push_post_conditions, push_profile_conditions,
};
use crate::infrastructure::rows::{
    comment_from_row, complete_sentiment_counts, config_entry_from_row, platform_count_from_row,
    post_from_row, profile_from_row, run_from_row, sentiment_group_from_row, COMMENT_COLUMNS,
    COMMENT_COLUMNS_C, CONFIG_COLUMNS, POST_COLUMNS, POST_COLUMNS_P, PROFILE_COLUMNS, RUN_COLUMNS,
};
use crate::models::{
    current_time_millis, to_millis, AnalysisRun, Comment, CommentFilter, NewComment, NewPost,
    NewProfile, OverviewCounts, Page, Pagination, Post, PostBatchOutcome, PostFilter, Profile,
    ProfileFilter, RunCounts, RunStatus, Sentiment, SentimentCount, StatsFilter,
};

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS config_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        value_type TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        platform TEXT NOT NULL,
        handle TEXT NOT NULL,
        display_name TEXT,
        last_analyzed_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (platform, handle)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        platform TEXT NOT NULL,
        native_id TEXT NOT NULL,
        url TEXT,
        text TEXT,
        likes INTEGER NOT NULL DEFAULT 0,
        comments_count INTEGER NOT NULL DEFAULT 0,
        shares INTEGER NOT NULL DEFAULT 0,
        views INTEGER NOT NULL DEFAULT 0,
        interactions_total INTEGER NOT NULL DEFAULT 0,
        posted_at INTEGER,
        scraped_at INTEGER NOT NULL,
        UNIQUE (platform, native_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        native_id TEXT NOT NULL,
        author TEXT,
        text TEXT,
        likes INTEGER NOT NULL DEFAULT 0,
        posted_at INTEGER,
        scraped_at INTEGER NOT NULL,
        sentiment_label TEXT NOT NULL DEFAULT 'UNCLASSIFIED',
        sentiment_confidence REAL,
        classification_source TEXT,
        classified_at INTEGER,
        UNIQUE (post_id, native_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL,
        forced BOOLEAN NOT NULL DEFAULT 0,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        new_posts INTEGER NOT NULL DEFAULT 0,
        new_comments INTEGER NOT NULL DEFAULT 0,
        classified_comments INTEGER NOT NULL DEFAULT 0,
        failed_items INTEGER NOT NULL DEFAULT 0,
        superseded_by INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_profiles (
        run_id INTEGER NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
        profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        PRIMARY KEY (run_id, profile_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profile_claims (
        profile_id INTEGER PRIMARY KEY REFERENCES profiles(id) ON DELETE CASCADE,
        run_id INTEGER NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
        claimed_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_posts_profile ON posts(profile_id, posted_at)",
    "CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id)",
    "CREATE INDEX IF NOT EXISTS idx_comments_sentiment ON comments(sentiment_label)",
    "CREATE INDEX IF NOT EXISTS idx_run_profiles_profile ON run_profiles(profile_id)",
    "CREATE INDEX IF NOT EXISTS idx_profile_claims_run ON profile_claims(run_id)",
];

const FILE_POOL_SIZE: u32 = 5;

/// SQLite implementation of the storage contract: the embedded default backend, and the
/// in-memory store used by tests.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// A private in-memory database. One pooled connection that is never recycled, since the
    /// data lives and dies with it.
    pub async fn new_in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AppError::Storage(format!("Invalid SQLite options: {}", e)))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                AppError::Storage(format!("Failed to connect to in-memory SQLite: {}", e))
            })?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Opens (creating if needed) a database file in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // WAL is persistent in the file, so it is switched on once before the pool exists.
        let mut conn = options.clone().connect().await.map_err(|e| {
            AppError::Storage(format!("Failed to open SQLite {}: {}", path.display(), e))
        })?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut conn)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to enable WAL: {}", e)))?;
        conn.close()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to close SQLite setup connection: {}", e)))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .min_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|e| {
                AppError::Storage(format!("Failed to open SQLite {}: {}", path.display(), e))
            })?;

        let db = Self { pool };
        db.initialize().await?;
        db.warm_up().await?;
        Ok(db)
    }

    /// Opens every pooled connection up front so none is established mid-request.
    async fn warm_up(&self) -> AppResult<()> {
        let mut held = Vec::with_capacity(FILE_POOL_SIZE as usize);
        for _ in 0..FILE_POOL_SIZE {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| AppError::Storage(format!("Failed to open pooled connection: {}", e)))?;
            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to open pooled connection: {}", e)))?;
            held.push(conn);
        }
        Ok(())
    }

    /// Creates missing tables and indexes. Existing data is left untouched.
    pub async fn initialize(&self) -> AppResult<()> {
        for statement in SQLITE_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to create schema: {}", e)))?;
        }
        info!(backend = "sqlite", "database schema ready");
        Ok(())
    }

    /// A statement left mid-step keeps its implicit transaction open on the pooled connection:
    /// an uncommitted RETURNING write, or a stale read snapshot. Statements outside an explicit
    /// transaction are therefore drained with `fetch_all`.
    fn first_row(rows: Vec<SqliteRow>) -> Option<SqliteRow> {
        rows.into_iter().next()
    }

    async fn begin(&self) -> AppResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to begin transaction: {}", e)))
    }

    async fn run_profile_ids(&self, run_ids: &[i64]) -> AppResult<BTreeMap<i64, Vec<i64>>> {
        let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        if run_ids.is_empty() {
            return Ok(grouped);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT run_id, profile_id FROM run_profiles WHERE run_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in run_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY run_id, profile_id");

        let rows: Vec<(i64, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load run profiles: {}", e)))?;
        for (run_id, profile_id) in rows {
            grouped.entry(run_id).or_default().push(profile_id);
        }
        Ok(grouped)
    }

    async fn sentiment_counts_in(
        tx: &mut Transaction<'_, Sqlite>,
        filter: &CommentFilter,
    ) -> AppResult<Vec<SentimentCount>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
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
            .map(sentiment_group_from_row::<SqliteRow>)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(complete_sentiment_counts(grouped))
    }
}

#[async_trait]
impl DatabaseInterface for SqliteDatabase {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Database health check failed: {}", e)))?;
        Ok(())
    }

    async fn upsert_profile(&self, profile: NewProfile) -> AppResult<Profile> {
        let sql = format!(
            "INSERT INTO profiles (platform, handle, display_name, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (platform, handle) DO UPDATE \
             SET display_name = COALESCE(excluded.display_name, profiles.display_name) \
             RETURNING {}",
            PROFILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(profile.platform.as_str())
            .bind(&profile.handle)
            .bind(&profile.display_name)
            .bind(current_time_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to upsert profile: {}", e)))?;
        let row = Self::first_row(rows)
            .ok_or_else(|| AppError::Storage("Profile upsert returned no row".to_string()))?;
        profile_from_row(&row)
    }

    async fn get_profiles(&self, filter: &ProfileFilter) -> AppResult<Vec<Profile>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM profiles pr", PROFILE_COLUMNS));
        push_profile_conditions(&mut qb, filter);
        qb.push(" ORDER BY pr.platform, pr.handle");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to query profiles: {}", e)))?;
        rows.iter().map(profile_from_row::<SqliteRow>).collect()
    }

    async fn delete_profile(&self, profile_id: i64) -> AppResult<bool> {
        let mut tx = self.begin().await?;

        // Both deletes skip a claimed profile; the first one also takes the write lock.
        sqlx::query(
            "DELETE FROM analysis_runs WHERE id IN \
             (SELECT run_id FROM run_profiles WHERE profile_id = ?) \
             AND NOT EXISTS (SELECT 1 FROM run_profiles rp \
             WHERE rp.run_id = analysis_runs.id AND rp.profile_id <> ?) \
             AND NOT EXISTS (SELECT 1 FROM profile_claims WHERE profile_id = ?)",
        )
        .bind(profile_id)
        .bind(profile_id)
        .bind(profile_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to delete orphaned runs: {}", e)))?;

        let deleted = sqlx::query(
            "DELETE FROM profiles WHERE id = ? \
             AND NOT EXISTS (SELECT 1 FROM profile_claims WHERE profile_id = ?)",
        )
        .bind(profile_id)
        .bind(profile_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to delete profile: {}", e)))?
        .rows_affected();

        let claimed: Option<i64> = if deleted == 0 {
            sqlx::query_scalar("SELECT run_id FROM profile_claims WHERE profile_id = ?")
                .bind(profile_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to load claim: {}", e)))?
        } else {
            None
        };

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to commit profile delete: {}", e)))?;

        if let Some(run_id) = claimed {
            warn!(profile_id, run_id, "refusing to delete a profile claimed by a running run");
            return Err(AppError::RunConflict {
                profile_ids: vec![profile_id],
            });
        }
        Ok(deleted > 0)
    }

    async fn mark_profile_analyzed(&self, profile_id: i64, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE profiles SET last_analyzed_at = ? WHERE id = ?")
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
        // The platform is read from the profile inside each write, so the transaction opens
        // with a write lock and never upgrades from a read snapshot.
        let insert_sql = format!(
            "INSERT INTO posts (profile_id, platform, native_id, url, text, likes, comments_count, \
             shares, views, interactions_total, posted_at, scraped_at) \
             SELECT pr.id, pr.platform, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? FROM profiles pr WHERE pr.id = ? \
             ON CONFLICT (platform, native_id) DO NOTHING RETURNING {}",
            POST_COLUMNS
        );
        let refresh_sql = format!(
            "UPDATE posts SET likes = ?, comments_count = ?, shares = ?, views = ?, \
             interactions_total = ?, scraped_at = ? \
             WHERE native_id = ? AND platform = (SELECT platform FROM profiles WHERE id = ?) \
             RETURNING {}",
            POST_COLUMNS
        );

        let now = current_time_millis();
        let mut outcome = PostBatchOutcome::default();
        let mut tx = self.begin().await?;
        for post in posts {
            let inserted = sqlx::query(&insert_sql)
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
                .bind(profile_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to insert post: {}", e)))?;
            if let Some(row) = Self::first_row(inserted) {
                outcome.inserted.push(post_from_row(&row)?);
                continue;
            }

            let refreshed = sqlx::query(&refresh_sql)
                .bind(post.likes)
                .bind(post.comments_count)
                .bind(post.shares)
                .bind(post.views)
                .bind(post.interactions_total())
                .bind(now)
                .bind(&post.native_id)
                .bind(profile_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to refresh post counters: {}", e)))?;
            match Self::first_row(refreshed) {
                Some(row) => outcome.refreshed.push(post_from_row(&row)?),
                None => {
                    // Neither inserted nor already known: the profile row is missing.
                    tx.rollback()
                        .await
                        .map_err(|e| AppError::Storage(format!("Failed to roll back posts: {}", e)))?;
                    return Err(AppError::NotFound(format!("Profile {} not found", profile_id)));
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
        let sql = format!(
            "INSERT INTO comments (post_id, native_id, author, text, likes, posted_at, scraped_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (post_id, native_id) DO NOTHING RETURNING {}",
            COMMENT_COLUMNS
        );

        let now = current_time_millis();
        let mut inserted = Vec::new();
        let mut tx = self.begin().await?;
        for comment in comments {
            let rows = sqlx::query(&sql)
                .bind(post_id)
                .bind(&comment.native_id)
                .bind(&comment.author)
                .bind(&comment.text)
                .bind(comment.likes)
                .bind(comment.posted_at.map(to_millis))
                .bind(now)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to insert comment: {}", e)))?;
            if let Some(row) = Self::first_row(rows) {
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
            "UPDATE comments SET sentiment_label = ?, sentiment_confidence = ?, \
             classification_source = ?, classified_at = ? \
             WHERE id = ? AND sentiment_label = 'UNCLASSIFIED'",
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
             WHERE p.profile_id = ? AND c.sentiment_label = 'UNCLASSIFIED' \
             ORDER BY c.id ASC LIMIT ?",
            COMMENT_COLUMNS_C
        );
        let rows = sqlx::query(&sql)
            .bind(profile_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load unclassified comments: {}", e)))?;
        rows.iter().map(comment_from_row::<SqliteRow>).collect()
    }

    async fn query_posts(&self, filter: &PostFilter, page: Pagination) -> AppResult<Page<Post>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM posts p", POST_COLUMNS_P));
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

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM posts p");
        push_post_conditions(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count posts: {}", e)))?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(Page {
            data: rows.iter().map(post_from_row::<SqliteRow>).collect::<AppResult<_>>()?,
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
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
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

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM comments c JOIN posts p ON c.post_id = p.id",
        );
        push_comment_conditions(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count comments: {}", e)))?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(Page {
            data: rows.iter().map(comment_from_row::<SqliteRow>).collect::<AppResult<_>>()?,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn aggregate_sentiment_counts(
        &self,
        filter: &StatsFilter,
    ) -> AppResult<Vec<SentimentCount>> {
        let mut tx = self.begin().await?;
        let counts = Self::sentiment_counts_in(&mut tx, &filter.comment_filter()).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to close snapshot: {}", e)))?;
        Ok(counts)
    }

    async fn aggregate_overview(&self, filter: &StatsFilter) -> AppResult<OverviewCounts> {
        // A deferred transaction in WAL mode pins one read snapshot for every statement below.
        let mut tx = self.begin().await?;

        let profile_filter = ProfileFilter {
            platform: filter.platform,
            ids: filter.profile_id.map(|id| vec![id]),
        };
        let post_filter = filter.post_filter();
        let comment_filter = filter.comment_filter();

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT (SELECT COUNT(*) FROM profiles pr");
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

        let mut qb = QueryBuilder::<Sqlite>::new(
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

        let mut qb = QueryBuilder::<Sqlite>::new(
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
            let (platform, count) = platform_count_from_row::<SqliteRow>(row, "posts")?;
            let (_, interactions) = platform_count_from_row::<SqliteRow>(row, "interactions")?;
            post_totals.push((platform, count, interactions));
        }
        let comment_totals = comment_rows
            .iter()
            .map(|row| platform_count_from_row::<SqliteRow>(row, "comments"))
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

        let mut tx = self.begin().await?;
        let now = current_time_millis();
        let run_id: i64 = sqlx::query_scalar::<_, i64>(
            "INSERT INTO analysis_runs (status, forced, started_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(RunStatus::Running.as_str())
        .bind(force)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to create run: {}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Storage("Run insert returned no id".to_string()))?;

        let mut contested = Vec::new();
        for &profile_id in &ids {
            sqlx::query("INSERT INTO run_profiles (run_id, profile_id) VALUES (?, ?)")
                .bind(run_id)
                .bind(profile_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to attach profile to run: {}", e)))?;

            let claimed = sqlx::query(
                "INSERT INTO profile_claims (profile_id, run_id, claimed_at) VALUES (?, ?, ?) \
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

            let previous: i64 =
                sqlx::query_scalar("SELECT run_id FROM profile_claims WHERE profile_id = ?")
                    .bind(profile_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| AppError::Storage(format!("Failed to load claim: {}", e)))?;
            sqlx::query(
                "UPDATE analysis_runs SET superseded_by = ? WHERE id = ? AND superseded_by IS NULL",
            )
            .bind(run_id)
            .bind(previous)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to mark run superseded: {}", e)))?;
            sqlx::query("UPDATE profile_claims SET run_id = ?, claimed_at = ? WHERE profile_id = ?")
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

        let sql = format!("SELECT {} FROM analysis_runs WHERE id = ?", RUN_COLUMNS);
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

        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE analysis_runs SET status = ?, finished_at = ?, new_posts = ?, \
             new_comments = ?, classified_comments = ?, failed_items = ? \
             WHERE id = ? AND status = 'running'",
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

        sqlx::query("DELETE FROM profile_claims WHERE run_id = ?")
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
        let sql = format!("SELECT {} FROM analysis_runs WHERE id = ?", RUN_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to load run: {}", e)))?;
        let Some(row) = Self::first_row(rows) else {
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
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM analysis_runs r", RUN_COLUMNS));
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM analysis_runs r");
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
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to count runs: {}", e)))?
            .into_iter()
            .next()
            .unwrap_or_default();

        let run_ids = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
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
        let sql = format!("SELECT {} FROM config_entries WHERE key = ?", CONFIG_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read config entry: {}", e)))?;
        Self::first_row(rows)
            .as_ref()
            .map(config_entry_from_row::<SqliteRow>)
            .transpose()
    }

    async fn list_config_entries(&self) -> AppResult<Vec<ConfigEntry>> {
        let sql = format!("SELECT {} FROM config_entries ORDER BY key", CONFIG_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list config entries: {}", e)))?;
        rows.iter().map(config_entry_from_row::<SqliteRow>).collect()
    }

    async fn put_config_entry(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
    ) -> AppResult<ConfigEntry> {
        let sql = format!(
            "INSERT INTO config_entries (key, value, value_type, version, updated_at) \
             VALUES (?, ?, ?, 1, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, \
             value_type = excluded.value_type, version = config_entries.version + 1, \
             updated_at = excluded.updated_at \
             RETURNING {}",
            CONFIG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(value_type)
            .bind(current_time_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to write config entry: {}", e)))?;
        let row = Self::first_row(rows)
            .ok_or_else(|| AppError::Storage("Config write returned no row".to_string()))?;
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
             VALUES (?, ?, ?, 1, ?) ON CONFLICT (key) DO NOTHING",
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
