// Services - request-level logic above the storage contract
pub mod profile_service;
pub mod stats_service;

pub use profile_service::{parse_handle_input, ProfileService, RegisterProfileRequest};
pub use stats_service::{OverviewStats, SentimentBucket, SentimentStats, StatsService};
