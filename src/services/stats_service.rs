// StatsService - read-only KPIs over one storage snapshot per call

use serde::Serialize;
use std::sync::Arc;

use crate::error::AppResult;
use crate::infrastructure::DatabaseInterface;
use crate::models::{PlatformTotals, SentimentCount, SentimentLabel, StatsFilter};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentBucket {
    pub label: SentimentLabel,
    pub count: i64,
    pub avg_confidence: Option<f64>,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentStats {
    pub total: i64,
    pub buckets: Vec<SentimentBucket>,
}

impl SentimentStats {
    pub fn count(&self, label: SentimentLabel) -> i64 {
        self.buckets
            .iter()
            .find(|b| b.label == label)
            .map(|b| b.count)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewStats {
    pub total_profiles: i64,
    pub total_posts: i64,
    pub total_comments: i64,
    pub total_interactions: i64,
    pub avg_interactions_per_post: f64,
    pub sentiment: SentimentStats,
    pub platforms: Vec<PlatformTotals>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentages are derived from the same counts they describe, so they always match the total.
pub fn sentiment_stats(counts: Vec<SentimentCount>) -> SentimentStats {
    let total: i64 = counts.iter().map(|c| c.count).sum();
    let buckets = counts
        .into_iter()
        .map(|c| SentimentBucket {
            percentage: if total > 0 {
                round2(c.count as f64 * 100.0 / total as f64)
            } else {
                0.0
            },
            label: c.label,
            count: c.count,
            avg_confidence: c.avg_confidence.map(round2),
        })
        .collect();
    SentimentStats { total, buckets }
}

#[derive(Clone)]
pub struct StatsService {
    db: Arc<dyn DatabaseInterface>,
}

impl StatsService {
    pub fn new(db: Arc<dyn DatabaseInterface>) -> Self {
        Self { db }
    }

    pub async fn sentiment(&self, filter: &StatsFilter) -> AppResult<SentimentStats> {
        let counts = self.db.aggregate_sentiment_counts(filter).await?;
        Ok(sentiment_stats(counts))
    }

    pub async fn overview(&self, filter: &StatsFilter) -> AppResult<OverviewStats> {
        let snapshot = self.db.aggregate_overview(filter).await?;
        let avg = if snapshot.posts > 0 {
            round2(snapshot.interactions as f64 / snapshot.posts as f64)
        } else {
            0.0
        };
        Ok(OverviewStats {
            total_profiles: snapshot.profiles,
            total_posts: snapshot.posts,
            total_comments: snapshot.comments,
            total_interactions: snapshot.interactions,
            avg_interactions_per_post: avg,
            sentiment: sentiment_stats(snapshot.sentiment),
            platforms: snapshot.platforms,
        })
    }
}
