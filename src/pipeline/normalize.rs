// Normalization of heterogeneous actor records into canonical posts and comments.
//
// Every platform's actors name the same facts differently. Each field is resolved through an
// ordered list of candidate keys; the first present, non-empty value wins.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::models::{NewComment, NewPost, Platform};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const EMBEDDED_COMMENT_FIELDS: &[&str] =
    &["latestComments", "comments", "commentsData", "topComments", "commentsList"];

/// A normalized post together with the comments its record carried inline.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPost {
    pub post: NewPost,
    pub embedded_comments: Vec<NewComment>,
    pub dropped_comments: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPosts {
    pub posts: Vec<NormalizedPost>,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedComments {
    pub comments: Vec<NewComment>,
    pub dropped: usize,
}

/// Collapses whitespace runs and trims. Blank text becomes `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    let cleaned = WHITESPACE.replace_all(raw.trim(), " ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.into_owned())
    }
}

/// Resolves `a.b` paths into nested objects.
fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |value, part| value.get(part))
        .filter(|value| !value.is_null())
}

fn first_string(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match lookup(record, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_text(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match lookup(record, key)? {
        Value::String(s) => clean_text(s),
        _ => None,
    })
}

fn as_count(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => {
            let s = s.trim().replace(',', "");
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))?
        }
        _ => return None,
    };
    Some(n.max(0))
}

/// First usable counter among `keys`. Negative or non-numeric values count as 0.
fn first_count(record: &Value, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|key| lookup(record, key))
        .find_map(as_count)
        .unwrap_or(0)
}

fn parse_unix(seconds_or_millis: f64) -> Option<DateTime<Utc>> {
    if !seconds_or_millis.is_finite() || seconds_or_millis <= 0.0 {
        return None;
    }
    let millis = if seconds_or_millis > 1e12 {
        seconds_or_millis
    } else {
        seconds_or_millis * 1000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => parse_unix(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<f64>().ok().and_then(parse_unix)
        }
        _ => None,
    }
}

fn first_timestamp(record: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|key| lookup(record, key))
        .find_map(parse_timestamp)
}

pub fn normalize_post(platform: Platform, record: &Value) -> Option<NewPost> {
    if !record.is_object() {
        return None;
    }
    let post = match platform {
        Platform::Tiktok => NewPost {
            native_id: first_string(record, &["id", "awemeId", "videoId", "webVideoUrl", "url"])?,
            url: first_string(record, &["webVideoUrl", "videoWebUrl", "url"]),
            text: first_text(record, &["text", "desc", "description"]),
            likes: first_count(record, &["diggCount", "likesCount", "likes"]),
            comments_count: first_count(record, &["commentCount", "commentsCount"]),
            shares: first_count(record, &["shareCount", "sharesCount", "shares"]),
            views: first_count(record, &["playCount", "viewsCount", "views", "viewCount"]),
            posted_at: first_timestamp(record, &["createTime", "createTimeISO", "timestamp"]),
        },
        Platform::Instagram | Platform::Facebook => NewPost {
            native_id: first_string(record, &["id", "postId", "shortCode", "url"])?,
            url: first_string(record, &["url", "postUrl", "webVideoUrl"]),
            text: first_text(record, &["text", "caption", "description"]),
            likes: first_count(record, &["likesCount", "likes", "reactionsCount", "diggCount"]),
            comments_count: first_count(record, &["commentsCount", "commentCount"]),
            shares: first_count(record, &["sharesCount", "shares", "shareCount"]),
            views: first_count(
                record,
                &["viewsCount", "videoViewCount", "videoPlayCount", "views", "playCount"],
            ),
            posted_at: first_timestamp(record, &["timestamp", "createdAt", "time"]),
        },
    };
    Some(post)
}

pub fn normalize_comment(record: &Value) -> Option<NewComment> {
    if !record.is_object() {
        return None;
    }
    let text = first_text(record, &["text", "comment", "content"]);
    let native_id = first_string(record, &["id", "commentId", "cid"])
        .or_else(|| text.as_ref().map(|t| t.chars().take(50).collect()))?;
    Some(NewComment {
        native_id,
        author: first_string(
            record,
            &[
                "ownerUsername",
                "author",
                "username",
                "uniqueId",
                "authorMeta.name",
                "profileName",
                "owner.username",
            ],
        ),
        text,
        likes: first_count(record, &["likesCount", "likes", "diggCount"]),
        posted_at: first_timestamp(record, &["timestamp", "createTime", "createTimeISO", "createdAt", "date"]),
    })
}

/// Comments shipped inside a post record. Numeric `comments` fields are counts, not lists.
pub fn embedded_comment_records(record: &Value) -> &[Value] {
    EMBEDDED_COMMENT_FIELDS
        .iter()
        .find_map(|field| match record.get(*field) {
            Some(Value::Array(items)) if !items.is_empty() => Some(items.as_slice()),
            _ => None,
        })
        .unwrap_or(&[])
}

pub fn normalize_comments(records: &[Value]) -> NormalizedComments {
    let mut out = NormalizedComments::default();
    for record in records {
        match normalize_comment(record) {
            Some(comment) => out.comments.push(comment),
            None => out.dropped += 1,
        }
    }
    out
}

/// Normalizes a posts dataset in scraper order, keeping the first record for a repeated id.
pub fn normalize_posts(platform: Platform, records: &[Value]) -> NormalizedPosts {
    let mut out = NormalizedPosts::default();
    for record in records {
        let Some(post) = normalize_post(platform, record) else {
            out.dropped += 1;
            continue;
        };
        if out.posts.iter().any(|p| p.post.native_id == post.native_id) {
            continue;
        }
        let embedded = normalize_comments(embedded_comment_records(record));
        out.posts.push(NormalizedPost {
            post,
            embedded_comments: embedded.comments,
            dropped_comments: embedded.dropped,
        });
    }
    out
}
