// Routes normalized content through the storage-level insert-if-absent operations. Storage is the
// source of truth for what has been seen; nothing is cached here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppResult;
use crate::infrastructure::DatabaseInterface;
use crate::models::{Comment, NewComment, NewPost, Post};

/// A post after ingestion, in the order the scraper returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub post: Post,
    pub is_new: bool,
}

pub struct Deduplicator {
    db: Arc<dyn DatabaseInterface>,
}

impl Deduplicator {
    pub fn new(db: Arc<dyn DatabaseInterface>) -> Self {
        Self { db }
    }

    /// Inserts unknown posts and refreshes counters of known ones. Every input post comes back
    /// exactly once so comments can still be attached to already-known posts.
    pub async fn ingest_posts(&self, profile_id: i64, posts: &[NewPost]) -> AppResult<Vec<StoredPost>> {
        if posts.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self.db.insert_posts_if_absent(profile_id, posts).await?;

        let mut by_native_id: HashMap<String, StoredPost> = HashMap::new();
        for post in outcome.inserted {
            by_native_id.insert(post.native_id.clone(), StoredPost { post, is_new: true });
        }
        for post in outcome.refreshed {
            by_native_id
                .entry(post.native_id.clone())
                .or_insert(StoredPost { post, is_new: false });
        }

        Ok(posts
            .iter()
            .filter_map(|p| by_native_id.remove(&p.native_id))
            .collect())
    }

    /// Returns only the comments that were not stored before; these are the ones to classify.
    pub async fn ingest_comments(&self, post_id: i64, comments: &[NewComment]) -> AppResult<Vec<Comment>> {
        if comments.is_empty() {
            return Ok(Vec::new());
        }
        self.db.insert_comments_if_absent(post_id, comments).await
    }
}
