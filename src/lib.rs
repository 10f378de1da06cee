// Social sentiment pipeline - ingestion, deduplication, classification and reporting

// Domain model - profiles, content, runs and query filters
pub mod models;

// Infrastructure - storage backends, row decoding and the persisted config store
pub mod infrastructure;

// Ingestion pipeline - scraper client, normalization, dedup and run orchestration
pub mod pipeline;

// Hybrid sentiment classifier and the lazily loaded inference handle
pub mod sentiment;

// Request-level services and the HTTP surface
pub mod services;
pub mod analytics_interface;
pub mod app_state;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use error::{AppError, AppResult};
