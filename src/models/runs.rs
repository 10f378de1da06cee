// Analysis run bookkeeping: the persisted audit row and the summary handed back to callers.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::models::social::{Platform, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(AppError::Validation(format!("Unknown run status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub new_posts: i64,
    pub new_comments: i64,
    pub classified_comments: i64,
    pub failed_items: i64,
}

impl RunCounts {
    pub fn absorb(&mut self, other: &RunCounts) {
        self.new_posts += other.new_posts;
        self.new_comments += other.new_comments;
        self.classified_comments += other.classified_comments;
        self.failed_items += other.failed_items;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: i64,
    pub profile_ids: Vec<i64>,
    pub status: RunStatus,
    pub force: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    /// Set when a forced run took over one of this run's profiles while it was still running.
    pub superseded_by: Option<i64>,
}

/// Result of `insert_posts_if_absent`: new rows, and existing rows whose counters were refreshed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostBatchOutcome {
    pub inserted: Vec<Post>,
    pub refreshed: Vec<Post>,
}

/// Longest look-back accepted for posting windows and the recent-analysis skip.
pub const MAX_WINDOW_DAYS: i64 = 3650;

/// Inclusive posting-day window applied to scraped posts. Posts without a date are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// The last N days including today. Takes priority over `from` and `to`.
    pub last_days: Option<i64>,
}

impl PostWindow {
    pub fn is_active(&self) -> bool {
        self.last_days.is_some_and(|days| days > 0) || self.from.is_some() || self.to.is_some()
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(days) = self.last_days {
            if !(0..=MAX_WINDOW_DAYS).contains(&days) {
                return Err(AppError::Validation(format!(
                    "last_days must be between 0 and {}",
                    MAX_WINDOW_DAYS
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::Validation(format!(
                    "Window start {} is after its end {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    pub fn bounds(&self, today: NaiveDate) -> (Option<NaiveDate>, Option<NaiveDate>) {
        match self.last_days {
            Some(days) if days > 0 => {
                let start = today.checked_sub_days(Days::new(days as u64 - 1));
                (Some(start.unwrap_or(NaiveDate::MIN)), Some(today))
            }
            _ => (self.from, self.to),
        }
    }

    pub fn admits(&self, posted_at: Option<DateTime<Utc>>, today: NaiveDate) -> bool {
        let Some(posted_at) = posted_at else {
            return true;
        };
        let day = posted_at.date_naive();
        let (from, to) = self.bounds(today);
        from.map_or(true, |from| day >= from) && to.map_or(true, |to| day <= to)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    /// `None` targets every registered profile.
    pub profile_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub window: PostWindow,
    /// Profiles analyzed fewer than this many days ago are skipped, unless the run is forced or
    /// a posting window is set.
    #[serde(default)]
    pub skip_recent_days: Option<i64>,
}

impl RunRequest {
    pub fn validate(&self) -> AppResult<()> {
        self.window.validate()?;
        if let Some(days) = self.skip_recent_days {
            if !(0..=MAX_WINDOW_DAYS).contains(&days) {
                return Err(AppError::Validation(format!(
                    "skip_recent_days must be between 0 and {}",
                    MAX_WINDOW_DAYS
                )));
            }
        }
        Ok(())
    }

    /// The look-back for skipping recently analyzed profiles, when it applies to this request.
    pub fn recent_skip_days(&self) -> Option<i64> {
        match self.skip_recent_days {
            Some(days) if days > 0 && !self.force && !self.window.is_active() => Some(days),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RunConflict,
    NotFound,
    AnalyzedRecently,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedProfile {
    pub profile_id: i64,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Posts,
    Comments,
    Classification,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub profile_id: i64,
    pub post_id: Option<i64>,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOutcome {
    pub profile_id: i64,
    pub platform: Platform,
    pub handle: String,
    pub posts_scraped: usize,
    pub comments_scraped: usize,
    pub dropped_records: usize,
    /// Posts outside the requested posting window.
    pub filtered_posts: usize,
    pub refreshed_posts: usize,
    pub counts: RunCounts,
}

/// What one run invocation achieved. Always reports successes, skips, and failures side by side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub status: Option<RunStatus>,
    pub counts: RunCounts,
    pub profiles: Vec<ProfileOutcome>,
    pub skipped: Vec<SkippedProfile>,
    pub failures: Vec<RunFailure>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn skipped_ids(&self, reason: SkipReason) -> Vec<i64> {
        self.skipped
            .iter()
            .filter(|s| s.reason == reason)
            .map(|s| s.profile_id)
            .collect()
    }
}
