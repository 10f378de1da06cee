// Core infrastructure modules
pub mod config_store;    // Versioned tunables persisted in the database
pub mod database;        // Storage contract and PostgreSQL backend
pub mod filters;         // Shared WHERE-clause builders
pub mod rows;            // Shared row decoding
pub mod sqlite_database; // Embedded SQLite backend

// Re-export core infrastructure components
pub use config_store::{
    ConfigEntry, ConfigKey, ConfigStore, ConfigValue, ConfigValueType, ConfigView,
    PipelineSettings,
};
pub use database::{connect_database, DatabaseInterface, PostgresDatabase};
pub use sqlite_database::SqliteDatabase;
