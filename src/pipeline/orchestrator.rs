// ScrapeOrchestrator - drives one analysis run from profile claim to classification.
//
// A run reads one configuration snapshot, claims its profiles, and then processes them with
// bounded concurrency. Within a profile, records are handled in scraper order. Failures of a
// single external call are recorded and the run moves on; only storage errors stop a profile.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::{ConfigStore, DatabaseInterface, PipelineSettings};
use crate::models::{
    AnalysisRun, Comment, ContentType, FailureStage, Platform, PostWindow, Profile, ProfileFilter,
    ProfileOutcome, RunCounts, RunFailure, RunRequest, RunStatus, RunSummary, SkipReason,
    SkippedProfile,
};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::normalize::{normalize_comments, normalize_posts};
use crate::pipeline::scraper::{ScrapeJob, ScraperClient, ScraperError};
use crate::sentiment::{InferenceHandle, SentimentClassifier};

/// Posts carrying fewer embedded comments than this get a dedicated comments job.
pub const EMBEDDED_COMMENT_THRESHOLD: usize = 5;

/// Upper bound on leftover UNCLASSIFIED comments retried per profile and run.
const UNCLASSIFIED_RETRY_LIMIT: i64 = 5_000;

pub struct ScrapeOrchestrator {
    db: Arc<dyn DatabaseInterface>,
    config: ConfigStore,
    scraper: Arc<dyn ScraperClient>,
    inference: Arc<InferenceHandle>,
    scrape_timeout: Duration,
    profile_concurrency: usize,
}

/// What processing one profile produced, before it is folded into the run summary.
#[derive(Debug)]
struct ProfileReport {
    outcome: ProfileOutcome,
    failures: Vec<RunFailure>,
    warnings: Vec<String>,
    /// The posts stage did not finish: the posts job failed or its content could not be stored.
    posts_failed: bool,
}

impl ProfileReport {
    fn new(profile: &Profile) -> Self {
        Self {
            outcome: ProfileOutcome {
                profile_id: profile.id,
                platform: profile.platform,
                handle: profile.handle.clone(),
                posts_scraped: 0,
                comments_scraped: 0,
                dropped_records: 0,
                filtered_posts: 0,
                refreshed_posts: 0,
                counts: RunCounts::default(),
            },
            failures: Vec::new(),
            warnings: Vec::new(),
            posts_failed: false,
        }
    }

    fn fail(&mut self, stage: FailureStage, post_id: Option<i64>, message: impl Into<String>) {
        let message = message.into();
        warn!(
            profile_id = self.outcome.profile_id,
            post_id = ?post_id,
            stage = ?stage,
            error = %message,
            "run item failed"
        );
        self.failures.push(RunFailure {
            profile_id: self.outcome.profile_id,
            post_id,
            stage,
            message,
        });
    }

    fn drop_records(&mut self, count: usize, what: &str) {
        if count == 0 {
            return;
        }
        self.outcome.dropped_records += count;
        let warning = format!(
            "{}/{}: dropped {} {} record(s) without required fields",
            self.outcome.platform, self.outcome.handle, count, what
        );
        warn!(profile_id = self.outcome.profile_id, count, what, "dropped unmappable records");
        self.warnings.push(warning);
    }
}

impl ScrapeOrchestrator {
    pub fn new(
        db: Arc<dyn DatabaseInterface>,
        config: ConfigStore,
        scraper: Arc<dyn ScraperClient>,
        inference: Arc<InferenceHandle>,
    ) -> Self {
        Self {
            db,
            config,
            scraper,
            inference,
            scrape_timeout: Duration::from_secs(300),
            profile_concurrency: 2,
        }
    }

    pub fn with_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.scrape_timeout = timeout;
        self
    }

    pub fn with_profile_concurrency(mut self, concurrency: usize) -> Self {
        self.profile_concurrency = concurrency.max(1);
        self
    }

    /// Executes one analysis run. Configuration problems fail before any run is recorded;
    /// everything after the claim is reported in the summary instead of returned as an error.
    #[instrument(skip(self, request), fields(force = request.force))]
    pub async fn run(&self, request: RunRequest) -> AppResult<RunSummary> {
        request.validate()?;
        let settings = self.config.snapshot().await?;
        let mut summary = RunSummary::default();

        let profiles = self.resolve_profiles(request.profile_ids.as_deref(), &mut summary).await?;
        if profiles.is_empty() {
            summary.warnings.push("No profiles to analyze".to_string());
            return Ok(summary);
        }

        let mut platforms: Vec<Platform> = Vec::new();
        for profile in &profiles {
            if !platforms.contains(&profile.platform) {
                platforms.push(profile.platform);
            }
        }
        settings.require_runnable(&platforms)?;

        let profiles = Self::skip_recently_analyzed(profiles, &request, &mut summary);
        if profiles.is_empty() {
            summary
                .warnings
                .push("Every requested profile was analyzed recently".to_string());
            return Ok(summary);
        }

        let Some(run) = self.claim(&profiles, request.force, &mut summary).await? else {
            summary
                .warnings
                .push("Every requested profile is claimed by an unfinished run".to_string());
            return Ok(summary);
        };
        info!(run_id = run.id, profiles = run.profile_ids.len(), "analysis run started");

        let claimed: Vec<Profile> = profiles
            .into_iter()
            .filter(|p| run.profile_ids.contains(&p.id))
            .collect();
        let classifier = SentimentClassifier::new(&settings, self.inference.clone());
        let window = request.window;

        let settings = &settings;
        let classifier = &classifier;
        let mut reports: Vec<ProfileReport> = stream::iter(claimed.clone())
            .map(|profile| async move {
                self.process_profile(&profile, settings, classifier, window).await
            })
            .buffer_unordered(self.profile_concurrency)
            .collect()
            .await;
        let order: HashMap<i64, usize> = claimed.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
        reports.sort_by_key(|r| order.get(&r.outcome.profile_id).copied().unwrap_or(usize::MAX));

        let all_posts_failed = !reports.is_empty() && reports.iter().all(|r| r.posts_failed);
        let status = if all_posts_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        for report in reports {
            summary.counts.absorb(&report.outcome.counts);
            summary.failures.extend(report.failures);
            summary.warnings.extend(report.warnings);
            summary.profiles.push(report.outcome);
        }

        let finished = self.db.complete_run(run.id, summary.counts, status).await?;
        if let Some(superseding) = finished.superseded_by {
            summary.warnings.push(format!(
                "Run {} was superseded by forced run {}",
                finished.id, superseding
            ));
        }
        info!(
            run_id = finished.id,
            status = finished.status.as_str(),
            new_posts = summary.counts.new_posts,
            new_comments = summary.counts.new_comments,
            classified = summary.counts.classified_comments,
            failed_items = summary.counts.failed_items,
            "analysis run finished"
        );

        summary.run_id = Some(finished.id);
        summary.status = Some(finished.status);
        Ok(summary)
    }

    /// `None` targets every registered profile. Unknown ids are reported as skipped.
    async fn resolve_profiles(
        &self,
        requested: Option<&[i64]>,
        summary: &mut RunSummary,
    ) -> AppResult<Vec<Profile>> {
        let Some(requested) = requested else {
            return self.db.get_profiles(&ProfileFilter::default()).await;
        };

        let mut ids: Vec<i64> = Vec::new();
        for id in requested {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        let found = self
            .db
            .get_profiles(&ProfileFilter {
                ids: Some(ids.clone()),
                ..Default::default()
            })
            .await?;

        let mut by_id: HashMap<i64, Profile> = found.into_iter().map(|p| (p.id, p)).collect();
        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.remove(&id) {
                Some(profile) => profiles.push(profile),
                None => summary.skipped.push(SkippedProfile {
                    profile_id: id,
                    reason: SkipReason::NotFound,
                }),
            }
        }
        Ok(profiles)
    }

    fn skip_recently_analyzed(
        profiles: Vec<Profile>,
        request: &RunRequest,
        summary: &mut RunSummary,
    ) -> Vec<Profile> {
        let Some(days) = request.recent_skip_days() else {
            return profiles;
        };
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
        profiles
            .into_iter()
            .filter(|profile| {
                let recent = profile.last_analyzed_at.is_some_and(|at| at > cutoff);
                if recent {
                    info!(
                        profile_id = profile.id,
                        last_analyzed_at = ?profile.last_analyzed_at,
                        days,
                        "skipping recently analyzed profile"
                    );
                    summary.skipped.push(SkippedProfile {
                        profile_id: profile.id,
                        reason: SkipReason::AnalyzedRecently,
                    });
                }
                !recent
            })
            .collect()
    }

    /// Claims the profiles, dropping contested ones until the claim succeeds or nothing is left.
    async fn claim(
        &self,
        profiles: &[Profile],
        force: bool,
        summary: &mut RunSummary,
    ) -> AppResult<Option<AnalysisRun>> {
        let mut candidates: Vec<i64> = profiles.iter().map(|p| p.id).collect();
        while !candidates.is_empty() {
            match self.db.begin_run(&candidates, force).await {
                Ok(run) => return Ok(Some(run)),
                Err(AppError::RunConflict { profile_ids }) => {
                    warn!(?profile_ids, "profiles claimed by an unfinished run, skipping");
                    let contested: HashSet<i64> = profile_ids.into_iter().collect();
                    for id in &candidates {
                        if contested.contains(id) {
                            summary.skipped.push(SkippedProfile {
                                profile_id: *id,
                                reason: SkipReason::RunConflict,
                            });
                        }
                    }
                    let before = candidates.len();
                    candidates.retain(|id| !contested.contains(id));
                    if candidates.len() == before {
                        // The conflict names nothing we asked for; retrying would loop.
                        return Err(AppError::Internal(
                            "Run conflict did not name any requested profile".to_string(),
                        ));
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn execute(&self, token: &str, job: ScrapeJob) -> Result<Vec<Value>, ScraperError> {
        debug!(
            platform = job.platform.as_str(),
            content_type = job.content_type.as_str(),
            actor_id = %job.actor_id,
            "running scrape job"
        );
        match tokio::time::timeout(
            self.scrape_timeout,
            self.scraper.run_actor(token, &job.actor_id, job.input),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ScraperError::Timeout(self.scrape_timeout)),
        }
    }

    #[instrument(skip_all, fields(profile_id = profile.id, platform = profile.platform.as_str()))]
    async fn process_profile(
        &self,
        profile: &Profile,
        settings: &PipelineSettings,
        classifier: &SentimentClassifier,
        window: PostWindow,
    ) -> ProfileReport {
        let mut report = ProfileReport::new(profile);
        let mut fresh: Vec<Comment> = Vec::new();

        if let Err(err) = self
            .ingest_profile(profile, settings, window, &mut report, &mut fresh)
            .await
        {
            report.posts_failed = true;
            report.outcome.counts.failed_items += 1;
            report.fail(FailureStage::Storage, None, err.to_string());
            return report;
        }
        if let Err(err) = self.classify_pending(profile, classifier, fresh, &mut report).await {
            report.fail(FailureStage::Storage, None, err.to_string());
            return report;
        }

        if !report.posts_failed {
            if let Err(err) = self.db.mark_profile_analyzed(profile.id, chrono::Utc::now()).await {
                report.fail(FailureStage::Storage, None, err.to_string());
            }
        }
        report
    }

    /// Scrapes and stores posts and comments. Newly stored comments are appended to `fresh`.
    /// Only storage errors are returned; scrape failures are recorded on the report.
    async fn ingest_profile(
        &self,
        profile: &Profile,
        settings: &PipelineSettings,
        window: PostWindow,
        report: &mut ProfileReport,
        fresh: &mut Vec<Comment>,
    ) -> AppResult<()> {
        let Some(posts_actor) = settings.actor(profile.platform, ContentType::Posts) else {
            report.posts_failed = true;
            report.fail(FailureStage::Posts, None, "No posts actor configured");
            return Ok(());
        };
        let job = ScrapeJob::posts(
            profile.platform,
            posts_actor,
            &profile.handle,
            settings.default_limit_posts,
            settings.default_limit_comments,
        );
        let records = match self.execute(&settings.apify_token, job).await {
            Ok(records) => records,
            Err(err) => {
                report.posts_failed = true;
                report.outcome.counts.failed_items += 1;
                report.fail(FailureStage::Posts, None, err.to_string());
                return Ok(());
            }
        };

        let mut normalized = normalize_posts(profile.platform, &records);
        report.drop_records(normalized.dropped, "post");
        report.outcome.posts_scraped = normalized.posts.len();

        if window.is_active() {
            let today = chrono::Utc::now().date_naive();
            normalized
                .posts
                .retain(|candidate| window.admits(candidate.post.posted_at, today));
            report.outcome.filtered_posts = report.outcome.posts_scraped - normalized.posts.len();
            debug!(
                profile_id = profile.id,
                kept = normalized.posts.len(),
                filtered = report.outcome.filtered_posts,
                "applied posting window"
            );
        }

        let new_posts: Vec<_> = normalized.posts.iter().map(|n| n.post.clone()).collect();
        let dedup = Deduplicator::new(self.db.clone());
        let stored = dedup.ingest_posts(profile.id, &new_posts).await?;
        report.outcome.counts.new_posts += stored.iter().filter(|s| s.is_new).count() as i64;
        report.outcome.refreshed_posts += stored.iter().filter(|s| !s.is_new).count();

        let by_native_id: HashMap<&str, _> = stored
            .iter()
            .map(|s| (s.post.native_id.as_str(), &s.post))
            .collect();
        let comments_actor = settings.actor(profile.platform, ContentType::Comments);

        for normalized_post in &normalized.posts {
            let Some(post) = by_native_id.get(normalized_post.post.native_id.as_str()) else {
                continue;
            };
            report.drop_records(normalized_post.dropped_comments, "comment");
            report.outcome.comments_scraped += normalized_post.embedded_comments.len();

            let inserted = dedup
                .ingest_comments(post.id, &normalized_post.embedded_comments)
                .await?;
            report.outcome.counts.new_comments += inserted.len() as i64;
            fresh.extend(inserted);

            if normalized_post.embedded_comments.len() >= EMBEDDED_COMMENT_THRESHOLD {
                continue;
            }
            let (Some(url), Some(actor)) = (post.url.as_deref(), comments_actor) else {
                continue;
            };
            let job = ScrapeJob::comments(
                profile.platform,
                actor,
                url,
                settings.default_limit_comments,
            );
            let records = match self.execute(&settings.apify_token, job).await {
                Ok(records) => records,
                Err(err) => {
                    report.outcome.counts.failed_items += 1;
                    report.fail(FailureStage::Comments, Some(post.id), err.to_string());
                    continue;
                }
            };

            let scraped = normalize_comments(&records);
            report.drop_records(scraped.dropped, "comment");
            report.outcome.comments_scraped += scraped.comments.len();
            let inserted = dedup.ingest_comments(post.id, &scraped.comments).await?;
            report.outcome.counts.new_comments += inserted.len() as i64;
            fresh.extend(inserted);
        }
        Ok(())
    }

    /// Classifies the comments stored by this run, then any left UNCLASSIFIED by earlier runs.
    async fn classify_pending(
        &self,
        profile: &Profile,
        classifier: &SentimentClassifier,
        fresh: Vec<Comment>,
        report: &mut ProfileReport,
    ) -> AppResult<()> {
        let mut seen: HashSet<i64> = fresh.iter().map(|c| c.id).collect();
        let mut pending = fresh;
        for comment in self
            .db
            .unclassified_comments(profile.id, UNCLASSIFIED_RETRY_LIMIT)
            .await?
        {
            if seen.insert(comment.id) {
                pending.push(comment);
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut left_unclassified = 0i64;
        let mut first_error: Option<String> = None;
        for comment in &pending {
            match classifier.classify(comment.text.as_deref()).await {
                Ok(sentiment) => {
                    if self.db.update_comment_sentiment(comment.id, &sentiment).await? {
                        report.outcome.counts.classified_comments += 1;
                    }
                }
                Err(err @ (AppError::ClassifierUnavailable(_) | AppError::ExternalService(_))) => {
                    left_unclassified += 1;
                    first_error.get_or_insert_with(|| err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(message) = first_error {
            report.outcome.counts.failed_items += left_unclassified;
            report.fail(
                FailureStage::Classification,
                None,
                format!(
                    "{} comment(s) left unclassified for a later run: {}",
                    left_unclassified, message
                ),
            );
        }
        debug!(
            profile_id = profile.id,
            model = classifier.model_id(),
            pending = pending.len(),
            left_unclassified,
            "classification pass finished"
        );
        Ok(())
    }
}
