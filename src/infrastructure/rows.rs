// Row decoding shared by both backends. Column names and storage encodings are identical in
// PostgreSQL and SQLite, so one generic mapper per entity keeps the two in lockstep.

use sqlx::{ColumnIndex, Decode, Row, Type};

use crate::error::{AppError, AppResult};
use crate::infrastructure::config_store::ConfigEntry;
use crate::models::{
    from_millis, AnalysisRun, ClassificationSource, Comment, Platform, Post, Profile, RunCounts,
    RunStatus, SentimentLabel,
};

pub const PROFILE_COLUMNS: &str =
    "id, platform, handle, display_name, last_analyzed_at, created_at";

pub const POST_COLUMNS: &str = "id, profile_id, platform, native_id, url, text, likes, \
     comments_count, shares, views, interactions_total, posted_at, scraped_at";

pub const POST_COLUMNS_P: &str = "p.id, p.profile_id, p.platform, p.native_id, p.url, p.text, \
     p.likes, p.comments_count, p.shares, p.views, p.interactions_total, p.posted_at, p.scraped_at";

pub const COMMENT_COLUMNS: &str = "id, post_id, native_id, author, text, likes, posted_at, \
     scraped_at, sentiment_label, sentiment_confidence, classification_source, classified_at";

pub const COMMENT_COLUMNS_C: &str = "c.id, c.post_id, c.native_id, c.author, c.text, c.likes, \
     c.posted_at, c.scraped_at, c.sentiment_label, c.sentiment_confidence, \
     c.classification_source, c.classified_at";

pub const RUN_COLUMNS: &str = "id, status, forced, started_at, finished_at, new_posts, \
     new_comments, classified_comments, failed_items, superseded_by";

pub const CONFIG_COLUMNS: &str = "key, value, value_type, version, updated_at";

fn column<'r, R, T>(row: &'r R, name: &'static str) -> AppResult<T>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get(name)
        .map_err(|e| AppError::Storage(format!("Failed to decode column {}: {}", name, e)))
}

fn parse_column<T>(raw: &str, name: &str) -> AppResult<T>
where
    T: std::str::FromStr<Err = AppError>,
{
    raw.parse()
        .map_err(|e| AppError::Storage(format!("Corrupt value in column {}: {}", name, e)))
}

pub fn profile_from_row<'r, R>(row: &'r R) -> AppResult<Profile>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let platform: String = column(row, "platform")?;
    let last_analyzed_at: Option<i64> = column(row, "last_analyzed_at")?;
    Ok(Profile {
        id: column(row, "id")?,
        platform: parse_column::<Platform>(&platform, "platform")?,
        handle: column(row, "handle")?,
        display_name: column(row, "display_name")?,
        last_analyzed_at: last_analyzed_at.map(from_millis),
        created_at: from_millis(column(row, "created_at")?),
    })
}

pub fn post_from_row<'r, R>(row: &'r R) -> AppResult<Post>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let platform: String = column(row, "platform")?;
    let posted_at: Option<i64> = column(row, "posted_at")?;
    Ok(Post {
        id: column(row, "id")?,
        profile_id: column(row, "profile_id")?,
        platform: parse_column::<Platform>(&platform, "platform")?,
        native_id: column(row, "native_id")?,
        url: column(row, "url")?,
        text: column(row, "text")?,
        likes: column(row, "likes")?,
        comments_count: column(row, "comments_count")?,
        shares: column(row, "shares")?,
        views: column(row, "views")?,
        interactions_total: column(row, "interactions_total")?,
        posted_at: posted_at.map(from_millis),
        scraped_at: from_millis(column(row, "scraped_at")?),
    })
}

pub fn comment_from_row<'r, R>(row: &'r R) -> AppResult<Comment>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    f64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let label: String = column(row, "sentiment_label")?;
    let source: Option<String> = column(row, "classification_source")?;
    let posted_at: Option<i64> = column(row, "posted_at")?;
    let classified_at: Option<i64> = column(row, "classified_at")?;
    Ok(Comment {
        id: column(row, "id")?,
        post_id: column(row, "post_id")?,
        native_id: column(row, "native_id")?,
        author: column(row, "author")?,
        text: column(row, "text")?,
        likes: column(row, "likes")?,
        posted_at: posted_at.map(from_millis),
        scraped_at: from_millis(column(row, "scraped_at")?),
        sentiment_label: parse_column::<SentimentLabel>(&label, "sentiment_label")?,
        sentiment_confidence: column(row, "sentiment_confidence")?,
        classification_source: source
            .map(|s| parse_column::<ClassificationSource>(&s, "classification_source"))
            .transpose()?,
        classified_at: classified_at.map(from_millis),
    })
}

/// Decodes a run row. Targeted profile ids live in `run_profiles` and are attached by the caller.
pub fn run_from_row<'r, R>(row: &'r R, profile_ids: Vec<i64>) -> AppResult<AnalysisRun>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    bool: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let status: String = column(row, "status")?;
    let finished_at: Option<i64> = column(row, "finished_at")?;
    Ok(AnalysisRun {
        id: column(row, "id")?,
        profile_ids,
        status: parse_column::<RunStatus>(&status, "status")?,
        force: column(row, "forced")?,
        started_at: from_millis(column(row, "started_at")?),
        finished_at: finished_at.map(from_millis),
        counts: RunCounts {
            new_posts: column(row, "new_posts")?,
            new_comments: column(row, "new_comments")?,
            classified_comments: column(row, "classified_comments")?,
            failed_items: column(row, "failed_items")?,
        },
        superseded_by: column(row, "superseded_by")?,
    })
}

pub fn config_entry_from_row<'r, R>(row: &'r R) -> AppResult<ConfigEntry>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(ConfigEntry {
        key: column(row, "key")?,
        value: column(row, "value")?,
        value_type: column(row, "value_type")?,
        version: column(row, "version")?,
        updated_at: from_millis(column(row, "updated_at")?),
    })
}

/// Every label in a fixed order, zero-filled where the query returned no group.
pub fn complete_sentiment_counts(
    grouped: Vec<(SentimentLabel, i64, Option<f64>)>,
) -> Vec<crate::models::SentimentCount> {
    SentimentLabel::ALL
        .iter()
        .map(|label| {
            let found = grouped.iter().find(|(l, _, _)| l == label);
            crate::models::SentimentCount {
                label: *label,
                count: found.map(|(_, count, _)| *count).unwrap_or(0),
                avg_confidence: found.and_then(|(_, _, avg)| *avg),
            }
        })
        .collect()
}

pub fn sentiment_group_from_row<'r, R>(row: &'r R) -> AppResult<(SentimentLabel, i64, Option<f64>)>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    f64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let label: String = column(row, "label")?;
    Ok((
        parse_column::<SentimentLabel>(&label, "label")?,
        column(row, "count")?,
        column(row, "avg_confidence")?,
    ))
}

pub fn platform_count_from_row<'r, R>(row: &'r R, count_column: &'static str) -> AppResult<(Platform, i64)>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    let platform: String = column(row, "platform")?;
    Ok((parse_column::<Platform>(&platform, "platform")?, column(row, count_column)?))
}
