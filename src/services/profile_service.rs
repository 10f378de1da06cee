// ProfileService - registration and removal of tracked profiles

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::infrastructure::DatabaseInterface;
use crate::models::{NewProfile, Platform, Profile, ProfileFilter};

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProfileRequest {
    /// A bare handle, `@handle`, or a profile URL.
    pub handle: String,
    pub platform: Option<Platform>,
    pub display_name: Option<String>,
}

/// Handle and platform recovered from user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInput {
    pub handle: String,
    pub platform: Option<Platform>,
}

/// Strips `@` and extracts the handle (and platform) from instagram/tiktok/facebook URLs.
pub fn parse_handle_input(raw: &str) -> HandleInput {
    let trimmed = raw.trim();
    let input = trimmed.strip_prefix('@').unwrap_or(trimmed);

    if input.starts_with("http://") || input.starts_with("https://") {
        if let Some(parsed) = parse_profile_url(input) {
            return parsed;
        }
    }
    HandleInput {
        handle: input.to_string(),
        platform: None,
    }
}

fn parse_profile_url(input: &str) -> Option<HandleInput> {
    let url = Url::parse(input).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|part| !part.is_empty()).collect())
        .unwrap_or_default();

    let platform = if host.contains("instagram.com") {
        Platform::Instagram
    } else if host.contains("tiktok.com") {
        Platform::Tiktok
    } else if host.contains("facebook.com") {
        Platform::Facebook
    } else {
        return None;
    };

    let handle = match platform {
        Platform::Tiktok => match segments.as_slice() {
            ["@", next, ..] => next.to_string(),
            [first, ..] => first.trim_start_matches('@').to_string(),
            [] => return None,
        },
        _ => segments.first()?.to_string(),
    };
    if handle.is_empty() {
        return None;
    }
    Some(HandleInput {
        handle,
        platform: Some(platform),
    })
}

#[derive(Clone)]
pub struct ProfileService {
    db: Arc<dyn DatabaseInterface>,
}

impl ProfileService {
    pub fn new(db: Arc<dyn DatabaseInterface>) -> Self {
        Self { db }
    }

    /// Registers a profile, or returns the existing one for the same platform and handle.
    pub async fn register(&self, request: RegisterProfileRequest) -> AppResult<Profile> {
        let parsed = parse_handle_input(&request.handle);
        let platform = match (parsed.platform, request.platform) {
            (Some(from_url), Some(given)) if from_url != given => {
                return Err(AppError::Validation(format!(
                    "URL points to {} but platform {} was given",
                    from_url, given
                )));
            }
            (Some(platform), _) | (None, Some(platform)) => platform,
            (None, None) => {
                return Err(AppError::Validation(
                    "Platform is required when a bare handle is given".to_string(),
                ));
            }
        };
        if parsed.handle.is_empty() || parsed.handle.chars().any(char::is_whitespace) {
            return Err(AppError::Validation(format!("Invalid handle: '{}'", request.handle)));
        }

        let display_name = request
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let profile = self
            .db
            .upsert_profile(NewProfile {
                platform,
                handle: parsed.handle,
                display_name,
            })
            .await?;
        info!(profile_id = profile.id, platform = %profile.platform, handle = %profile.handle, "profile registered");
        Ok(profile)
    }

    pub async fn list(&self, platform: Option<Platform>) -> AppResult<Vec<Profile>> {
        self.db
            .get_profiles(&ProfileFilter {
                platform,
                ..Default::default()
            })
            .await
    }

    pub async fn delete(&self, profile_id: i64) -> AppResult<()> {
        if !self.db.delete_profile(profile_id).await? {
            return Err(AppError::NotFound(format!("Profile {} not found", profile_id)));
        }
        info!(profile_id, "profile deleted");
        Ok(())
    }
}
