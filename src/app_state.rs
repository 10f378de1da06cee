use std::sync::Arc;

use crate::{
    config::Config,
    infrastructure::{connect_database, ConfigStore, DatabaseInterface},
    pipeline::{ApifyClient, ScrapeOrchestrator, ScraperClient},
    sentiment::InferenceHandle,
    services::{ProfileService, StatsService},
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseInterface>,
    pub config_store: ConfigStore,
    pub orchestrator: Arc<ScrapeOrchestrator>,
    pub inference: Arc<InferenceHandle>,
    pub scraper: Arc<dyn ScraperClient>,
    pub profiles: ProfileService,
    pub stats: StatsService,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Initialize database
        let db = connect_database(&config.database).await?;

        let scraper: Arc<dyn ScraperClient> = Arc::new(ApifyClient::new(&config.scraper));
        let inference = Arc::new(InferenceHandle::from_config(&config.inference));

        let state = Self::from_parts(&config, db, scraper, inference);
        state.config_store.seed_defaults().await?;
        Ok(state)
    }

    /// Wires the state around already-built collaborators. Tests pass fakes here.
    pub fn from_parts(
        config: &Config,
        db: Arc<dyn DatabaseInterface>,
        scraper: Arc<dyn ScraperClient>,
        inference: Arc<InferenceHandle>,
    ) -> Self {
        let config_store = ConfigStore::new(db.clone());
        let orchestrator = ScrapeOrchestrator::new(
            db.clone(),
            config_store.clone(),
            scraper.clone(),
            inference.clone(),
        )
        .with_scrape_timeout(config.scraper.timeout())
        .with_profile_concurrency(config.pipeline.profile_concurrency);

        Self {
            profiles: ProfileService::new(db.clone()),
            stats: StatsService::new(db.clone()),
            orchestrator: Arc::new(orchestrator),
            config_store,
            inference,
            scraper,
            db,
        }
    }
}
