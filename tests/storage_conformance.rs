// One behavioural suite, run against every storage backend.

mod common;

use chrono::{TimeZone, Utc};
use social_sentiment::{
    error::AppError,
    infrastructure::DatabaseInterface,
    models::{
        ClassificationSource, CommentFilter, NewComment, NewPost, NewProfile, Pagination, Platform,
        PostFilter, Profile, ProfileFilter, RunCounts, RunStatus, Sentiment, SentimentLabel,
        StatsFilter,
    },
};

use common::backends;

async fn profile(db: &dyn DatabaseInterface, platform: Platform, handle: &str) -> Profile {
    db.upsert_profile(NewProfile {
        platform,
        handle: handle.to_string(),
        display_name: None,
    })
    .await
    .unwrap()
}

fn post(native_id: &str, likes: i64, day: u32) -> NewPost {
    NewPost {
        native_id: native_id.to_string(),
        url: Some(format!("https://example.com/{}", native_id)),
        text: Some(format!("post {}", native_id)),
        likes,
        comments_count: 1,
        shares: 0,
        views: 10,
        posted_at: Some(Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()),
    }
}

fn comment(native_id: &str, text: &str) -> NewComment {
    NewComment {
        native_id: native_id.to_string(),
        author: Some("fan".to_string()),
        text: Some(text.to_string()),
        likes: 0,
        posted_at: None,
    }
}

fn keyword(label: SentimentLabel) -> Sentiment {
    Sentiment {
        label,
        confidence: 0.9,
        source: ClassificationSource::KeywordRule,
    }
}

#[tokio::test]
async fn test_upsert_profile_is_unique_per_platform_and_handle() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let a = profile(db, Platform::Instagram, "alice").await;
        let again = profile(db, Platform::Instagram, "alice").await;
        let other = profile(db, Platform::Tiktok, "alice").await;
        assert_eq!(a.id, again.id, "{}", backend.name);
        assert_ne!(a.id, other.id, "{}", backend.name);

        let instagram = db
            .get_profiles(&ProfileFilter {
                platform: Some(Platform::Instagram),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(instagram.len(), 1, "{}", backend.name);

        let none = db
            .get_profiles(&ProfileFilter {
                ids: Some(vec![]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty(), "{}", backend.name);
    }
}

#[tokio::test]
async fn test_posts_are_inserted_once_and_counters_refreshed() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;

        let first = db
            .insert_posts_if_absent(alice.id, &[post("p1", 5, 1), post("p2", 7, 2)])
            .await
            .unwrap();
        assert_eq!(first.inserted.len(), 2, "{}", backend.name);
        assert!(first.refreshed.is_empty(), "{}", backend.name);
        assert_eq!(first.inserted[0].interactions_total, 16, "{}", backend.name);

        let mut edited = post("p1", 50, 1);
        edited.text = Some("edited caption".to_string());
        let second = db
            .insert_posts_if_absent(alice.id, &[edited, post("p3", 1, 3)])
            .await
            .unwrap();
        assert_eq!(second.inserted.len(), 1, "{}", backend.name);
        assert_eq!(second.inserted[0].native_id, "p3", "{}", backend.name);
        assert_eq!(second.refreshed.len(), 1, "{}", backend.name);
        let refreshed = &second.refreshed[0];
        assert_eq!(refreshed.id, first.inserted[0].id, "{}", backend.name);
        assert_eq!(refreshed.likes, 50, "{}", backend.name);
        assert_eq!(refreshed.interactions_total, 61, "{}", backend.name);
        // Identity and content are immutable once captured.
        assert_eq!(refreshed.text.as_deref(), Some("post p1"), "{}", backend.name);

        let all = db
            .query_posts(&PostFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(all.total, 3, "{}", backend.name);
    }
}

#[tokio::test]
async fn test_posts_for_unknown_profile_are_rejected() {
    for backend in backends().await {
        let result = backend.db.insert_posts_if_absent(999, &[post("p1", 1, 1)]).await;
        assert!(matches!(result, Err(AppError::NotFound(_))), "{}", backend.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingestion_never_duplicates_or_fails() {
    for backend in backends().await {
        let alice = profile(backend.db.as_ref(), Platform::Instagram, "alice").await;

        // Every fresh connection sees the committed profile.
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let db = backend.db.clone();
                tokio::spawn(async move { db.get_profiles(&ProfileFilter::default()).await })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap().len(), 1, "{}", backend.name);
        }

        let batch: Vec<NewPost> = (0..50)
            .map(|i| post(&format!("p{}", i), i, 1 + (i % 28) as u32))
            .collect();
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let db = backend.db.clone();
                let batch = batch.clone();
                tokio::spawn(async move { db.insert_posts_if_absent(alice.id, &batch).await })
            })
            .collect();

        let mut inserted = 0;
        for writer in writers {
            let outcome = writer
                .await
                .unwrap()
                .unwrap_or_else(|err| panic!("{}: {}", backend.name, err));
            assert_eq!(
                outcome.inserted.len() + outcome.refreshed.len(),
                50,
                "{}",
                backend.name
            );
            inserted += outcome.inserted.len();
        }
        assert_eq!(inserted, 50, "{}", backend.name);

        let stored = backend
            .db
            .query_posts(&PostFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(stored.total, 50, "{}", backend.name);
    }
}

#[tokio::test]
async fn test_comments_are_inserted_once_in_input_order() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let posts = db
            .insert_posts_if_absent(alice.id, &[post("p1", 1, 1), post("p2", 1, 2)])
            .await
            .unwrap();
        let (p1, p2) = (posts.inserted[0].id, posts.inserted[1].id);

        let inserted = db
            .insert_comments_if_absent(p1, &[comment("c2", "b"), comment("c1", "a")])
            .await
            .unwrap();
        let ids: Vec<&str> = inserted.iter().map(|c| c.native_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"], "{}", backend.name);
        assert!(inserted
            .iter()
            .all(|c| c.sentiment_label == SentimentLabel::Unclassified));

        let again = db
            .insert_comments_if_absent(p1, &[comment("c1", "changed"), comment("c3", "c")])
            .await
            .unwrap();
        assert_eq!(again.len(), 1, "{}", backend.name);
        assert_eq!(again[0].native_id, "c3", "{}", backend.name);

        // The same native id under another post is a different comment.
        let other = db
            .insert_comments_if_absent(p2, &[comment("c1", "a")])
            .await
            .unwrap();
        assert_eq!(other.len(), 1, "{}", backend.name);

        let page = db
            .query_comments(
                &CommentFilter {
                    post_id: Some(p1),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3, "{}", backend.name);
    }
}

#[tokio::test]
async fn test_comment_is_classified_at_most_once() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let posts = db
            .insert_posts_if_absent(alice.id, &[post("p1", 1, 1)])
            .await
            .unwrap();
        let comments = db
            .insert_comments_if_absent(posts.inserted[0].id, &[comment("c1", "I love it")])
            .await
            .unwrap();
        let id = comments[0].id;

        assert!(db
            .update_comment_sentiment(id, &keyword(SentimentLabel::Positive))
            .await
            .unwrap());
        assert!(!db
            .update_comment_sentiment(id, &keyword(SentimentLabel::Negative))
            .await
            .unwrap());
        assert!(matches!(
            db.update_comment_sentiment(id, &keyword(SentimentLabel::Unclassified))
                .await,
            Err(AppError::Validation(_))
        ));

        let stored = db
            .query_comments(&CommentFilter::default(), Pagination::default())
            .await
            .unwrap();
        let stored = &stored.data[0];
        assert_eq!(stored.sentiment_label, SentimentLabel::Positive, "{}", backend.name);
        assert_eq!(stored.sentiment_confidence, Some(0.9), "{}", backend.name);
        assert_eq!(stored.classification_source, Some(ClassificationSource::KeywordRule));
        assert!(stored.classified_at.is_some(), "{}", backend.name);
        assert!(db.unclassified_comments(alice.id, 10).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_unclassified_comments_are_listed_oldest_first() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let bob = profile(db, Platform::Instagram, "bob").await;
        let alice_post = db
            .insert_posts_if_absent(alice.id, &[post("a1", 1, 1)])
            .await
            .unwrap()
            .inserted[0]
            .id;
        let bob_post = db
            .insert_posts_if_absent(bob.id, &[post("b1", 1, 1)])
            .await
            .unwrap()
            .inserted[0]
            .id;
        db.insert_comments_if_absent(alice_post, &[comment("x", "1"), comment("y", "2")])
            .await
            .unwrap();
        db.insert_comments_if_absent(bob_post, &[comment("z", "3")])
            .await
            .unwrap();

        let pending = db.unclassified_comments(alice.id, 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|c| c.native_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"], "{}", backend.name);
        assert_eq!(db.unclassified_comments(alice.id, 1).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_post_filters_and_pagination() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let bob = profile(db, Platform::Tiktok, "bob").await;
        db.insert_posts_if_absent(alice.id, &[post("a1", 100, 1), post("a2", 1, 10)])
            .await
            .unwrap();
        db.insert_posts_if_absent(bob.id, &[post("b1", 5, 5)])
            .await
            .unwrap();

        let tiktok = db
            .query_posts(
                &PostFilter {
                    platform: Some(Platform::Tiktok),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(tiktok.total, 1, "{}", backend.name);
        assert_eq!(tiktok.data[0].platform, Platform::Tiktok, "{}", backend.name);

        let popular = db
            .query_posts(
                &PostFilter {
                    min_interactions: Some(50),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(popular.total, 1, "{}", backend.name);
        assert_eq!(popular.data[0].native_id, "a1", "{}", backend.name);

        let march_first_week = db
            .query_posts(
                &PostFilter {
                    date_from: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                    date_to: Some(Utc.with_ymd_and_hms(2024, 3, 5, 23, 59, 59).unwrap()),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(march_first_week.total, 2, "{}", backend.name);

        let page = db
            .query_posts(&PostFilter::default(), Pagination::new(Some(2), Some(0)))
            .await
            .unwrap();
        assert_eq!(page.total, 3, "{}", backend.name);
        assert_eq!(page.data.len(), 2, "{}", backend.name);
        // Newest first.
        assert_eq!(page.data[0].native_id, "a2", "{}", backend.name);

        let rest = db
            .query_posts(&PostFilter::default(), Pagination::new(Some(2), Some(2)))
            .await
            .unwrap();
        assert_eq!(rest.data.len(), 1, "{}", backend.name);
        assert_eq!(rest.data[0].native_id, "a1", "{}", backend.name);
    }
}

#[tokio::test]
async fn test_sentiment_counts_sum_to_filtered_total() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let bob = profile(db, Platform::Facebook, "bob").await;
        let alice_post = db
            .insert_posts_if_absent(alice.id, &[post("a1", 1, 1)])
            .await
            .unwrap()
            .inserted[0]
            .id;
        let bob_post = db
            .insert_posts_if_absent(bob.id, &[post("b1", 1, 1)])
            .await
            .unwrap()
            .inserted[0]
            .id;

        let alice_comments = db
            .insert_comments_if_absent(
                alice_post,
                &[comment("1", "a"), comment("2", "b"), comment("3", "c")],
            )
            .await
            .unwrap();
        db.insert_comments_if_absent(bob_post, &[comment("4", "d")])
            .await
            .unwrap();
        db.update_comment_sentiment(alice_comments[0].id, &keyword(SentimentLabel::Positive))
            .await
            .unwrap();
        db.update_comment_sentiment(
            alice_comments[1].id,
            &Sentiment {
                label: SentimentLabel::Negative,
                confidence: 0.7,
                source: ClassificationSource::Model,
            },
        )
        .await
        .unwrap();

        let all = db.aggregate_sentiment_counts(&StatsFilter::default()).await.unwrap();
        let labels: Vec<SentimentLabel> = all.iter().map(|c| c.label).collect();
        assert_eq!(labels, SentimentLabel::ALL.to_vec(), "{}", backend.name);
        assert_eq!(all.iter().map(|c| c.count).sum::<i64>(), 4, "{}", backend.name);
        assert_eq!(all[3].count, 2, "{}", backend.name);
        assert_eq!(all[1].avg_confidence, Some(0.7), "{}", backend.name);
        assert_eq!(all[2].count, 0, "{}", backend.name);

        let only_alice = db
            .aggregate_sentiment_counts(&StatsFilter {
                profile_id: Some(alice.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_alice.iter().map(|c| c.count).sum::<i64>(), 3, "{}", backend.name);

        let overview = db.aggregate_overview(&StatsFilter::default()).await.unwrap();
        assert_eq!(overview.profiles, 2, "{}", backend.name);
        assert_eq!(overview.posts, 2, "{}", backend.name);
        assert_eq!(overview.comments, 4, "{}", backend.name);
        assert_eq!(overview.interactions, 24, "{}", backend.name);
        assert_eq!(
            overview.platforms.iter().map(|p| p.comments).sum::<i64>(),
            overview.comments,
            "{}",
            backend.name
        );
        assert_eq!(
            overview.platforms.iter().map(|p| p.posts).sum::<i64>(),
            overview.posts,
            "{}",
            backend.name
        );

        let facebook = db
            .aggregate_overview(&StatsFilter {
                platform: Some(Platform::Facebook),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(facebook.profiles, 1, "{}", backend.name);
        assert_eq!(facebook.comments, 1, "{}", backend.name);
        assert_eq!(facebook.platforms.len(), 1, "{}", backend.name);
    }
}

#[tokio::test]
async fn test_run_claims_conflict_unless_forced() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let bob = profile(db, Platform::Instagram, "bob").await;

        let first = db.begin_run(&[alice.id], false).await.unwrap();
        assert_eq!(first.status, RunStatus::Running, "{}", backend.name);

        match db.begin_run(&[bob.id, alice.id], false).await {
            Err(AppError::RunConflict { profile_ids }) => {
                assert_eq!(profile_ids, vec![alice.id], "{}", backend.name)
            }
            other => panic!("{}: expected conflict, got {:?}", backend.name, other),
        }
        // The failed claim left nothing behind: bob is still free.
        let bob_run = db.begin_run(&[bob.id], false).await.unwrap();
        db.complete_run(bob_run.id, RunCounts::default(), RunStatus::Completed)
            .await
            .unwrap();

        let forced = db.begin_run(&[alice.id], true).await.unwrap();
        assert!(forced.force, "{}", backend.name);
        let superseded = db.get_run(first.id).await.unwrap().unwrap();
        assert_eq!(superseded.superseded_by, Some(forced.id), "{}", backend.name);

        // The superseded run finishing does not release the forced run's claim.
        db.complete_run(first.id, RunCounts::default(), RunStatus::Completed)
            .await
            .unwrap();
        assert!(matches!(
            db.begin_run(&[alice.id], false).await,
            Err(AppError::RunConflict { .. })
        ));

        let counts = RunCounts {
            new_posts: 3,
            new_comments: 1,
            classified_comments: 1,
            failed_items: 0,
        };
        let done = db.complete_run(forced.id, counts, RunStatus::Completed).await.unwrap();
        assert_eq!(done.counts, counts, "{}", backend.name);
        assert!(done.finished_at.is_some(), "{}", backend.name);
        assert!(db.begin_run(&[alice.id], false).await.is_ok(), "{}", backend.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_grant_exactly_one_run() {
    for backend in backends().await {
        let alice = profile(backend.db.as_ref(), Platform::Instagram, "alice").await;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let db = backend.db.clone();
                tokio::spawn(async move { db.begin_run(&[alice.id], false).await })
            })
            .collect();
        let (mut granted, mut conflicts) = (0, 0);
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => granted += 1,
                Err(AppError::RunConflict { .. }) => conflicts += 1,
                Err(err) => panic!("{}: unexpected error {}", backend.name, err),
            }
        }
        assert_eq!((granted, conflicts), (1, 15), "{}", backend.name);
    }
}

#[tokio::test]
async fn test_complete_run_rejects_finished_and_unknown_runs() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let run = db.begin_run(&[alice.id], false).await.unwrap();

        assert!(matches!(
            db.complete_run(run.id, RunCounts::default(), RunStatus::Running).await,
            Err(AppError::Validation(_))
        ));
        db.complete_run(run.id, RunCounts::default(), RunStatus::Failed)
            .await
            .unwrap();
        assert!(matches!(
            db.complete_run(run.id, RunCounts::default(), RunStatus::Completed).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            db.complete_run(4242, RunCounts::default(), RunStatus::Completed).await,
            Err(AppError::NotFound(_))
        ));

        let runs = db.list_runs(Some(alice.id), Pagination::default()).await.unwrap();
        assert_eq!(runs.total, 1, "{}", backend.name);
        assert_eq!(runs.data[0].status, RunStatus::Failed, "{}", backend.name);
        assert_eq!(runs.data[0].profile_ids, vec![alice.id], "{}", backend.name);
    }
}

#[tokio::test]
async fn test_delete_profile_cascades() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        let alice = profile(db, Platform::Instagram, "alice").await;
        let bob = profile(db, Platform::Instagram, "bob").await;
        let post_id = db
            .insert_posts_if_absent(alice.id, &[post("a1", 1, 1)])
            .await
            .unwrap()
            .inserted[0]
            .id;
        db.insert_comments_if_absent(post_id, &[comment("c1", "hi")])
            .await
            .unwrap();
        let solo = db.begin_run(&[alice.id], false).await.unwrap();
        db.complete_run(solo.id, RunCounts::default(), RunStatus::Completed)
            .await
            .unwrap();
        let shared = db.begin_run(&[alice.id, bob.id], false).await.unwrap();

        // Refused while the running run still holds alice's claim.
        match db.delete_profile(alice.id).await {
            Err(AppError::RunConflict { profile_ids }) => {
                assert_eq!(profile_ids, vec![alice.id], "{}", backend.name)
            }
            other => panic!("{}: expected conflict, got {:?}", backend.name, other),
        }
        assert_eq!(
            db.query_posts(&PostFilter::default(), Pagination::default())
                .await
                .unwrap()
                .total,
            1,
            "{}",
            backend.name
        );
        db.complete_run(shared.id, RunCounts::default(), RunStatus::Completed)
            .await
            .unwrap();

        assert!(db.delete_profile(alice.id).await.unwrap(), "{}", backend.name);
        assert!(!db.delete_profile(alice.id).await.unwrap(), "{}", backend.name);

        let posts = db
            .query_posts(
                &PostFilter {
                    profile_id: Some(alice.id),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(posts.total, 0, "{}", backend.name);
        let comments = db
            .query_comments(
                &CommentFilter {
                    profile_id: Some(alice.id),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(comments.total, 0, "{}", backend.name);
        let runs = db.list_runs(Some(alice.id), Pagination::default()).await.unwrap();
        assert_eq!(runs.total, 0, "{}", backend.name);
        assert!(db.get_run(solo.id).await.unwrap().is_none(), "{}", backend.name);

        // A run that also targeted bob survives with bob only.
        let shared = db.get_run(shared.id).await.unwrap().unwrap();
        assert_eq!(shared.profile_ids, vec![bob.id], "{}", backend.name);
    }
}

#[tokio::test]
async fn test_config_entries_are_versioned() {
    for backend in backends().await {
        let db = backend.db.as_ref();
        assert!(db.insert_config_default("default_limit_posts", "50", "integer").await.unwrap());
        assert!(!db.insert_config_default("default_limit_posts", "99", "integer").await.unwrap());

        let entry = db.get_config_entry("default_limit_posts").await.unwrap().unwrap();
        assert_eq!(entry.value, "50", "{}", backend.name);
        assert_eq!(entry.version, 1, "{}", backend.name);

        let updated = db
            .put_config_entry("default_limit_posts", "75", "integer")
            .await
            .unwrap();
        assert_eq!(updated.version, 2, "{}", backend.name);
        assert_eq!(updated.value, "75", "{}", backend.name);

        let fresh = db.put_config_entry("huggingface_model", "m", "string").await.unwrap();
        assert_eq!(fresh.version, 1, "{}", backend.name);
        assert_eq!(db.list_config_entries().await.unwrap().len(), 2, "{}", backend.name);
        assert!(db.get_config_entry("missing").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_health_check_passes() {
    for backend in backends().await {
        backend.db.health_check().await.unwrap();
    }
}
