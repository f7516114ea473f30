//! Local persistence for cold-storage sensor readings.
//!
//! Every decoded reading is written here so the service can answer history
//! queries after the live stream has moved on.
//!
//! # Features
//!
//! - Append readings one at a time or in a single transaction
//! - Track each storage unit's first and last report
//! - Query by unit, sensor kind and time range with pagination
//! - Prune old readings
//!
//! # Example
//!
//! ```no_run
//! use coldchain_store::{ReadingQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let query = ReadingQuery::new().unit("5").limit(10);
//! let readings = store.query_readings(&query)?;
//! # Ok::<(), coldchain_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{StoredReading, StoredUnit};
pub use queries::ReadingQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/coldchain/readings.db`
/// - macOS: `~/Library/Application Support/coldchain/readings.db`
/// - Windows: `C:\Users\<user>\AppData\Local\coldchain\readings.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("coldchain")
        .join("readings.db")
}
