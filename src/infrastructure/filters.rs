// WHERE-clause builders shared by both backends. QueryBuilder renders the backend's own
// placeholder syntax, so the clause text is written once.
//
// Aliases: `pr` = profiles, `p` = posts, `c` = comments. Date bounds keep rows with an unknown
// posted-at timestamp.

use sqlx::{Database, Encode, QueryBuilder, Type};

use crate::models::{to_millis, CommentFilter, PostFilter, ProfileFilter};

pub fn push_profile_conditions<'a, DB>(qb: &mut QueryBuilder<'a, DB>, filter: &ProfileFilter)
where
    DB: Database,
    i64: Encode<'a, DB> + Type<DB>,
    String: Encode<'a, DB> + Type<DB>,
{
    qb.push(" WHERE 1 = 1");
    if let Some(platform) = filter.platform {
        qb.push(" AND pr.platform = ").push_bind(platform.as_str().to_string());
    }
    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            qb.push(" AND 1 = 0");
        } else {
            qb.push(" AND pr.id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }
    }
}

pub fn push_post_conditions<'a, DB>(qb: &mut QueryBuilder<'a, DB>, filter: &PostFilter)
where
    DB: Database,
    i64: Encode<'a, DB> + Type<DB>,
    String: Encode<'a, DB> + Type<DB>,
{
    qb.push(" WHERE 1 = 1");
    if let Some(platform) = filter.platform {
        qb.push(" AND p.platform = ").push_bind(platform.as_str().to_string());
    }
    if let Some(profile_id) = filter.profile_id {
        qb.push(" AND p.profile_id = ").push_bind(profile_id);
    }
    if let Some(post_id) = filter.post_id {
        qb.push(" AND p.id = ").push_bind(post_id);
    }
    if let Some(min) = filter.min_interactions {
        qb.push(" AND p.interactions_total >= ").push_bind(min);
    }
    if let Some(from) = filter.date_from {
        qb.push(" AND (p.posted_at >= ")
            .push_bind(to_millis(from))
            .push(" OR p.posted_at IS NULL)");
    }
    if let Some(to) = filter.date_to {
        qb.push(" AND (p.posted_at <= ")
            .push_bind(to_millis(to))
            .push(" OR p.posted_at IS NULL)");
    }
}

/// Expects `FROM comments c JOIN posts p ON c.post_id = p.id`.
pub fn push_comment_conditions<'a, DB>(qb: &mut QueryBuilder<'a, DB>, filter: &CommentFilter)
where
    DB: Database,
    i64: Encode<'a, DB> + Type<DB>,
    String: Encode<'a, DB> + Type<DB>,
{
    qb.push(" WHERE 1 = 1");
    if let Some(platform) = filter.platform {
        qb.push(" AND p.platform = ").push_bind(platform.as_str().to_string());
    }
    if let Some(profile_id) = filter.profile_id {
        qb.push(" AND p.profile_id = ").push_bind(profile_id);
    }
    if let Some(post_id) = filter.post_id {
        qb.push(" AND c.post_id = ").push_bind(post_id);
    }
    if let Some(label) = filter.sentiment {
        qb.push(" AND c.sentiment_label = ").push_bind(label.as_str().to_string());
    }
    if let Some(min) = filter.min_likes {
        qb.push(" AND c.likes >= ").push_bind(min);
    }
    if let Some(from) = filter.date_from {
        qb.push(" AND (c.posted_at >= ")
            .push_bind(to_millis(from))
            .push(" OR c.posted_at IS NULL)");
    }
    if let Some(to) = filter.date_to {
        qb.push(" AND (c.posted_at <= ")
            .push_bind(to_millis(to))
            .push(" OR c.posted_at IS NULL)");
    }
}
