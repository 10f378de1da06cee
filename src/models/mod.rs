// Domain model - profiles, content, runs and the query vocabulary over them

pub mod query;
pub mod runs;
pub mod social;

pub use query::{
    parse_day_end, parse_day_start, CommentFilter, OverviewCounts, Page, Pagination,
    PlatformTotals, PostFilter, ProfileFilter, SentimentCount, StatsFilter,
};
pub use runs::{
    AnalysisRun, FailureStage, PostBatchOutcome, PostWindow, ProfileOutcome, RunCounts,
    RunFailure, RunRequest, RunStatus, RunSummary, SkipReason, SkippedProfile, MAX_WINDOW_DAYS,
};
pub use social::{
    ClassificationSource, Comment, ContentType, NewComment, NewPost, NewProfile, Platform, Post,
    Profile, Sentiment, SentimentLabel,
};

use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Storage timestamps are UTC epoch milliseconds in both backends.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}
