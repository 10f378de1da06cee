// End-to-end analysis runs over an in-memory store with fake collaborators.

mod common;

use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use social_sentiment::{
    error::AppError,
    infrastructure::SqliteDatabase,
    models::{
        ClassificationSource, CommentFilter, FailureStage, Pagination, Platform, PostFilter,
        PostWindow, RunRequest, RunStatus, SentimentLabel, SkipReason, StatsFilter,
    },
};

use common::{
    comment, instagram_post, instagram_profile_url, FakeLoader, Harness, PostWritesFailing,
};

fn run_for(ids: &[i64]) -> RunRequest {
    RunRequest {
        profile_ids: Some(ids.to_vec()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_alice_scenario() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let target = instagram_profile_url("alice");

    h.scraper.respond(
        &target,
        vec![
            instagram_post("p1", 10, vec![comment("c1", "I love it")]),
            instagram_post("p2", 20, vec![]),
            instagram_post("p3", 30, vec![]),
        ],
    );
    let first = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(first.status, Some(RunStatus::Completed));
    assert_eq!(first.counts.new_posts, 3);
    assert_eq!(first.counts.new_comments, 1);
    assert_eq!(first.counts.classified_comments, 1);
    assert!(first.failures.is_empty());

    let comments = h
        .db
        .query_comments(&CommentFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(comments.total, 1);
    let labelled = &comments.data[0];
    assert_eq!(labelled.sentiment_label, SentimentLabel::Positive);
    assert_eq!(labelled.sentiment_confidence, Some(0.9));
    assert_eq!(labelled.classification_source, Some(ClassificationSource::KeywordRule));

    h.scraper.respond(
        &target,
        vec![
            instagram_post("p1", 11, vec![comment("c1", "I love it")]),
            instagram_post("p2", 20, vec![]),
            instagram_post("p3", 30, vec![]),
            instagram_post("p4", 40, vec![]),
        ],
    );
    let second = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(second.counts.new_posts, 1);
    assert_eq!(second.counts.new_comments, 0);
    assert_eq!(second.profiles[0].refreshed_posts, 3);

    let posts = h
        .db
        .query_posts(&PostFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(posts.total, 4);
    let p1 = posts.data.iter().find(|p| p.native_id == "p1").unwrap();
    assert_eq!(p1.likes, 11);

    let profile = h.state.profiles.list(None).await.unwrap().remove(0);
    assert!(profile.last_analyzed_at.is_some());
}

#[tokio::test]
async fn test_rerun_is_idempotent_and_labels_are_stable() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![instagram_post(
            "p1",
            5,
            vec![
                comment("c1", "great stuff"),
                comment("c2", "just a comment"),
                comment("c3", "worst ever"),
            ],
        )],
    );

    h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    let before = h
        .db
        .query_comments(&CommentFilter::default(), Pagination::default())
        .await
        .unwrap();

    let again = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(again.counts.new_posts, 0);
    assert_eq!(again.counts.new_comments, 0);
    assert_eq!(again.counts.classified_comments, 0);

    let after = h
        .db
        .query_comments(&CommentFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(before.total, 3);
    assert_eq!(after.total, 3);
    for (old, new) in before.data.iter().zip(after.data.iter()) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.sentiment_label, new.sentiment_label);
        assert_eq!(old.classification_source, new.classification_source);
        assert_eq!(old.classified_at, new.classified_at);
    }

    let model_labelled = after.data.iter().find(|c| c.native_id == "c2").unwrap();
    assert_eq!(model_labelled.sentiment_label, SentimentLabel::Neutral);
    assert_eq!(model_labelled.classification_source, Some(ClassificationSource::Model));
    assert_eq!(model_labelled.sentiment_confidence, Some(0.66));
}

#[tokio::test]
async fn test_unfinished_run_makes_profile_skipped_unless_forced() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let bob = h.profile(Platform::Instagram, "bob").await;
    h.scraper.respond(
        &instagram_profile_url("bob"),
        vec![instagram_post("b1", 1, vec![])],
    );

    let stale = h.db.begin_run(&[alice.id], false).await.unwrap();

    let summary = h
        .state
        .orchestrator
        .run(run_for(&[alice.id, bob.id]))
        .await
        .unwrap();
    assert_eq!(summary.skipped_ids(SkipReason::RunConflict), vec![alice.id]);
    assert_eq!(summary.status, Some(RunStatus::Completed));
    assert_eq!(summary.profiles.len(), 1);
    assert_eq!(summary.profiles[0].profile_id, bob.id);
    assert_eq!(summary.counts.new_posts, 1);

    let only_alice = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert!(only_alice.run_id.is_none());
    assert_eq!(only_alice.skipped_ids(SkipReason::RunConflict), vec![alice.id]);
    assert!(!only_alice.warnings.is_empty());
    assert_eq!(h.scraper.calls_for(&instagram_profile_url("alice")), 0);

    let forced = h
        .state
        .orchestrator
        .run(RunRequest {
            profile_ids: Some(vec![alice.id]),
            force: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(forced.skipped.is_empty());
    assert_eq!(forced.status, Some(RunStatus::Completed));

    let stale = h.db.get_run(stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, RunStatus::Running);
    assert_eq!(stale.superseded_by, forced.run_id);
}

#[tokio::test]
async fn test_classifier_outage_leaves_comments_for_next_run() {
    let h = Harness::with_loader(FakeLoader::new(false)).await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![instagram_post(
            "p1",
            5,
            vec![comment("c1", "great"), comment("c2", "hmm, interesting")],
        )],
    );

    let first = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(first.status, Some(RunStatus::Completed));
    assert_eq!(first.counts.new_comments, 2);
    assert_eq!(first.counts.classified_comments, 1);
    assert_eq!(first.counts.failed_items, 1);
    assert!(first
        .failures
        .iter()
        .any(|f| f.stage == FailureStage::Classification));

    let pending = h.db.unclassified_comments(alice.id, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].native_id, "c2");

    h.loader.set_available(true);
    let second = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(second.counts.new_comments, 0);
    assert_eq!(second.counts.classified_comments, 1);
    assert!(second.failures.is_empty());
    assert!(h.db.unclassified_comments(alice.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_fails_only_when_every_posts_job_fails() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let bob = h.profile(Platform::Instagram, "bob").await;
    h.scraper.fail(&instagram_profile_url("alice"), "actor crashed");
    h.scraper.respond(
        &instagram_profile_url("bob"),
        vec![instagram_post("b1", 1, vec![])],
    );

    let partial = h
        .state
        .orchestrator
        .run(run_for(&[alice.id, bob.id]))
        .await
        .unwrap();
    assert_eq!(partial.status, Some(RunStatus::Completed));
    assert_eq!(partial.counts.new_posts, 1);
    assert_eq!(partial.failures.len(), 1);
    assert_eq!(partial.failures[0].profile_id, alice.id);
    assert_eq!(partial.failures[0].stage, FailureStage::Posts);

    let failed = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(failed.status, Some(RunStatus::Failed));
    let stored = h.db.get_run(failed.run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.counts.failed_items, 1);

    // The claim was released despite the failure.
    assert!(h.db.begin_run(&[alice.id], false).await.is_ok());
}

#[tokio::test]
async fn test_invalid_token_fails_before_any_run_is_created() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.db.put_config_entry("apify_token", "", "string").await.unwrap();

    let result = h.state.orchestrator.run(run_for(&[alice.id])).await;
    assert!(matches!(result, Err(AppError::Configuration(_))));
    let runs = h.db.list_runs(None, Pagination::default()).await.unwrap();
    assert_eq!(runs.total, 0);
    assert_eq!(h.scraper.total_calls(), 0);
}

#[tokio::test]
async fn test_unknown_profiles_are_skipped() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;

    let summary = h
        .state
        .orchestrator
        .run(run_for(&[alice.id, 404]))
        .await
        .unwrap();
    assert_eq!(summary.skipped_ids(SkipReason::NotFound), vec![404]);
    assert_eq!(summary.status, Some(RunStatus::Completed));

    let nothing = h.state.orchestrator.run(run_for(&[404])).await.unwrap();
    assert!(nothing.run_id.is_none());
}

#[tokio::test]
async fn test_comments_job_runs_only_for_posts_with_few_embedded_comments() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let busy: Vec<_> = (0..5)
        .map(|i| comment(&format!("e{}", i), "fine"))
        .collect();
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![instagram_post("busy", 1, busy), instagram_post("quiet", 1, vec![])],
    );
    h.scraper.respond(
        "https://www.instagram.com/p/quiet/",
        vec![
            json!({"id": "q1", "text": "love this", "ownerUsername": "a"}),
            json!({"text": "   "}),
            json!({"id": "q2", "text": "bad take"}),
        ],
    );

    let summary = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(h.scraper.calls_for("https://www.instagram.com/p/busy/"), 0);
    assert_eq!(h.scraper.calls_for("https://www.instagram.com/p/quiet/"), 1);
    assert_eq!(summary.counts.new_comments, 7);
    assert_eq!(summary.profiles[0].dropped_records, 1);
    assert!(!summary.warnings.is_empty());

    let negative = h
        .db
        .query_comments(
            &CommentFilter {
                sentiment: Some(SentimentLabel::Negative),
                ..Default::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(negative.total, 1);
    assert_eq!(negative.data[0].native_id, "q2");
}

#[tokio::test]
async fn test_comments_job_failure_is_recorded_per_post() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![instagram_post("p1", 1, vec![]), instagram_post("p2", 1, vec![])],
    );
    h.scraper.fail("https://www.instagram.com/p/p1/", "rate limited");

    let summary = h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(summary.status, Some(RunStatus::Completed));
    assert_eq!(summary.counts.new_posts, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Comments);
    assert!(summary.failures[0].post_id.is_some());
}

#[tokio::test]
async fn test_omitted_ids_target_every_profile() {
    let h = Harness::new().await;
    h.profile(Platform::Instagram, "alice").await;
    h.profile(Platform::Tiktok, "bob").await;
    h.scraper
        .respond("@bob", vec![json!({"id": "v1", "diggCount": 3, "playCount": 100})]);

    let summary = h.state.orchestrator.run(RunRequest::default()).await.unwrap();
    assert_eq!(summary.profiles.len(), 2);
    assert_eq!(summary.counts.new_posts, 1);
}

#[tokio::test]
async fn test_stats_reflect_run_results() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![
            instagram_post("p1", 10, vec![comment("c1", "love it"), comment("c2", "terrible")]),
            instagram_post("p2", 30, vec![comment("c3", "")]),
        ],
    );
    h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();

    let sentiment = h.state.stats.sentiment(&StatsFilter::default()).await.unwrap();
    assert_eq!(sentiment.total, 3);
    assert_eq!(sentiment.count(SentimentLabel::Positive), 1);
    assert_eq!(sentiment.count(SentimentLabel::Negative), 1);
    assert_eq!(sentiment.count(SentimentLabel::Neutral), 1);
    assert_eq!(sentiment.count(SentimentLabel::Unclassified), 0);

    let overview = h.state.stats.overview(&StatsFilter::default()).await.unwrap();
    assert_eq!(overview.total_profiles, 1);
    assert_eq!(overview.total_posts, 2);
    assert_eq!(overview.total_comments, 3);
    // likes + commentsCount per post: (10 + 2) + (30 + 1)
    assert_eq!(overview.total_interactions, 43);
    assert_eq!(overview.avg_interactions_per_post, 21.5);
    assert_eq!(overview.platforms.len(), 1);
    assert_eq!(overview.platforms[0].comments, 3);
}

#[tokio::test]
async fn test_deleting_profile_removes_its_history() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![instagram_post("p1", 1, vec![comment("c1", "love")])],
    );
    h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();

    h.state.profiles.delete(alice.id).await.unwrap();

    let scoped_posts = PostFilter {
        profile_id: Some(alice.id),
        ..Default::default()
    };
    let scoped_comments = CommentFilter {
        profile_id: Some(alice.id),
        ..Default::default()
    };
    assert_eq!(h.db.query_posts(&scoped_posts, Pagination::default()).await.unwrap().total, 0);
    assert_eq!(
        h.db.query_comments(&scoped_comments, Pagination::default())
            .await
            .unwrap()
            .total,
        0
    );
    assert_eq!(h.db.list_runs(Some(alice.id), Pagination::default()).await.unwrap().total, 0);
    assert_eq!(h.db.list_runs(None, Pagination::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_recently_analyzed_profiles_are_skipped_unless_forced() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let target = instagram_profile_url("alice");
    h.scraper.respond(&target, vec![instagram_post("p1", 1, vec![])]);
    h.state.orchestrator.run(run_for(&[alice.id])).await.unwrap();
    assert_eq!(h.scraper.calls_for(&target), 1);

    let recent = RunRequest {
        profile_ids: Some(vec![alice.id]),
        skip_recent_days: Some(7),
        ..Default::default()
    };
    let skipped = h.state.orchestrator.run(recent.clone()).await.unwrap();
    assert_eq!(skipped.run_id, None);
    assert_eq!(skipped.skipped_ids(SkipReason::AnalyzedRecently), vec![alice.id]);
    assert_eq!(h.scraper.calls_for(&target), 1);

    let forced = RunRequest {
        force: true,
        ..recent.clone()
    };
    let rerun = h.state.orchestrator.run(forced).await.unwrap();
    assert_eq!(rerun.status, Some(RunStatus::Completed));
    assert!(rerun.skipped.is_empty());

    let windowed = RunRequest {
        window: PostWindow {
            last_days: Some(30),
            ..Default::default()
        },
        ..recent
    };
    let rerun = h.state.orchestrator.run(windowed).await.unwrap();
    assert_eq!(rerun.status, Some(RunStatus::Completed));
    assert_eq!(h.scraper.calls_for(&target), 3);
}

#[tokio::test]
async fn test_posting_window_keeps_only_posts_inside_it() {
    let h = Harness::new().await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let mut spring = instagram_post("p2", 2, vec![comment("c2", "love it")]);
    spring["timestamp"] = json!("2024-05-01T10:00:00.000Z");
    let mut undated = instagram_post("p3", 3, vec![]);
    undated["timestamp"] = json!(null);
    h.scraper.respond(
        &instagram_profile_url("alice"),
        vec![
            instagram_post("p1", 1, vec![comment("c1", "love it")]),
            spring,
            undated,
        ],
    );

    let request = RunRequest {
        profile_ids: Some(vec![alice.id]),
        window: PostWindow {
            from: NaiveDate::from_ymd_opt(2024, 3, 1),
            to: NaiveDate::from_ymd_opt(2024, 6, 30),
            last_days: None,
        },
        ..Default::default()
    };
    let summary = h.state.orchestrator.run(request).await.unwrap();
    assert_eq!(summary.profiles[0].posts_scraped, 3);
    assert_eq!(summary.profiles[0].filtered_posts, 1);
    assert_eq!(summary.counts.new_posts, 2);
    assert_eq!(summary.counts.new_comments, 1);

    let posts = h
        .db
        .query_posts(&PostFilter::default(), Pagination::default())
        .await
        .unwrap();
    let mut ids: Vec<_> = posts.data.iter().map(|p| p.native_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["p2", "p3"]);

    let backwards = RunRequest {
        window: PostWindow {
            from: NaiveDate::from_ymd_opt(2024, 6, 30),
            to: NaiveDate::from_ymd_opt(2024, 3, 1),
            last_days: None,
        },
        ..Default::default()
    };
    let err = h.state.orchestrator.run(backwards).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_storage_outage_on_every_profile_fails_the_run() {
    let inner = Arc::new(SqliteDatabase::new_in_memory().await.unwrap());
    let h = Harness::over(Arc::new(PostWritesFailing { inner }), FakeLoader::new(true)).await;
    let alice = h.profile(Platform::Instagram, "alice").await;
    let bob = h.profile(Platform::Instagram, "bob").await;
    for handle in ["alice", "bob"] {
        h.scraper.respond(
            &instagram_profile_url(handle),
            vec![instagram_post(&format!("{handle}-1"), 1, vec![])],
        );
    }

    let summary = h
        .state
        .orchestrator
        .run(run_for(&[alice.id, bob.id]))
        .await
        .unwrap();
    assert_eq!(summary.status, Some(RunStatus::Failed));
    assert_eq!(summary.counts.failed_items, 2);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary.failures.iter().all(|f| f.stage == FailureStage::Storage));

    let run = h.db.get_run(summary.run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}
