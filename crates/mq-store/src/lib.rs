//! SQLite store access for MQ System
//!
//! One serialised connection per daemon, additive migrations, and the
//! statements used by the history writer and the script catalog.

mod error;
mod history;
mod schema;
mod scripts;
mod store;

pub use error::{StoreError, StoreResult};
pub use history::{format_timestamp, LatestSample, RowId};
pub use schema::{Migration, HISTORY_MIGRATIONS, SCRIPT_MIGRATIONS};
pub use scripts::ScriptRecord;
pub use store::Store;
