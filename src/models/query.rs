// Filter vocabulary shared by the list endpoints, the stats endpoints and both storage backends.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::social::{Platform, SentimentLabel};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFilter {
    pub platform: Option<Platform>,
    pub ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostFilter {
    pub platform: Option<Platform>,
    pub profile_id: Option<i64>,
    /// Restricts to one post; used by the stats endpoints.
    pub post_id: Option<i64>,
    pub min_interactions: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentFilter {
    pub platform: Option<Platform>,
    pub profile_id: Option<i64>,
    pub post_id: Option<i64>,
    pub sentiment: Option<SentimentLabel>,
    pub min_likes: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// Filters accepted by the aggregation operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsFilter {
    pub platform: Option<Platform>,
    pub profile_id: Option<i64>,
    pub post_id: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl StatsFilter {
    pub fn post_filter(&self) -> PostFilter {
        PostFilter {
            platform: self.platform,
            profile_id: self.profile_id,
            post_id: self.post_id,
            date_from: self.date_from,
            date_to: self.date_to,
            ..Default::default()
        }
    }

    pub fn comment_filter(&self) -> CommentFilter {
        CommentFilter {
            platform: self.platform,
            profile_id: self.profile_id,
            post_id: self.post_id,
            date_from: self.date_from,
            date_to: self.date_to,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentCount {
    pub label: SentimentLabel,
    pub count: i64,
    pub avg_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformTotals {
    pub platform: Platform,
    pub posts: i64,
    pub interactions: i64,
    pub comments: i64,
}

/// Raw overview numbers read from one storage snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverviewCounts {
    pub profiles: i64,
    pub posts: i64,
    pub comments: i64,
    pub interactions: i64,
    pub sentiment: Vec<SentimentCount>,
    pub platforms: Vec<PlatformTotals>,
}

/// Parses a `YYYY-MM-DD` bound as the first millisecond of that UTC day.
pub fn parse_day_start(raw: &str) -> AppResult<DateTime<Utc>> {
    let date = parse_day(raw)?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| AppError::BadRequest(format!("Invalid date: {}", raw)))
}

/// Parses a `YYYY-MM-DD` bound as the last millisecond of that UTC day, so the day is inclusive.
pub fn parse_day_end(raw: &str) -> AppResult<DateTime<Utc>> {
    let date = parse_day(raw)?;
    date.and_hms_milli_opt(23, 59, 59, 999)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| AppError::BadRequest(format!("Invalid date: {}", raw)))
}

fn parse_day(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        AppError::BadRequest(format!("Invalid date '{}'. Use YYYY-MM-DD", raw))
    })
}
