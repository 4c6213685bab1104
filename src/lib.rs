//! statecache Library
//!
//! This library exposes the core modules of statecache for use in integration tests
//! and as a library for other applications.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod models;
pub mod readiness;
pub mod shutdown;
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result};

// Re-export model types
pub use models::{Header, Query, QueryOutcome, Record, StoredItem, TopicPartitionOffset};

// Re-export API server functions
pub use api::server::{create_router, create_server};
pub use api::AppState;

// Re-export lifecycle types
pub use readiness::ReadinessGate;
pub use shutdown::{Shutdown, ShutdownReason};
