//! Configuration management
//!
//! `AppConfig` is persisted as a single JSON row in SQLite and cached
//! behind an `ArcSwap` for lock-free reads from the broadcast loops.

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
