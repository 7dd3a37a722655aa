//! Storage module for database and configuration.

pub mod config;
pub mod database;
pub mod schema;
pub mod store;
pub mod writer;

pub use config::{load_config, save_config, AppConfig, ConfigError};
pub use database::{Database, DatabaseError, WorkoutOverview};
pub use store::{shared, SharedStore, WorkoutStore};
pub use writer::StoreWriter;
