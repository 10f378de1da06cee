// Ingestion pipeline: scrape, normalize, deduplicate, classify
pub mod dedup;
pub mod normalize;
pub mod orchestrator;
pub mod scraper;

pub use dedup::{Deduplicator, StoredPost};
pub use orchestrator::{ScrapeOrchestrator, EMBEDDED_COMMENT_THRESHOLD};
pub use scraper::{AccountUsage, ApifyClient, ScrapeJob, ScraperClient, ScraperError};
