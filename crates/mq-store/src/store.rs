//! The shared SQLite handle

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::schema::{Migration, HISTORY_MIGRATIONS, SCRIPT_MIGRATIONS};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A single SQLite connection shared by every thread of a daemon
///
/// The connection is opened in serialised mode and every statement runs
/// under the store mutex.
pub struct Store {
    conn: Mutex<Connection>,
    location: String,
}

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

fn ensure_thread_safe() -> StoreResult<()> {
    // SAFETY: sqlite3_threadsafe takes no arguments and only reads the
    // SQLITE_THREADSAFE compile-time setting. rusqlite exposes no safe
    // wrapper for it: its open flags pick a per-connection mode but cannot
    // report a library built single-threaded, so the raw call is the only check.
    let mode = unsafe { rusqlite::ffi::sqlite3_threadsafe() };
    if mode == 0 {
        return Err(StoreError::NotThreadSafe(mode));
    }
    Ok(())
}

impl Store {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        ensure_thread_safe()?;
        let path = path.as_ref();
        let open_error = |source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open_with_flags(path, open_flags()).map_err(open_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(open_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_error)?;

        info!(path = %path.display(), "Opened store");
        Ok(Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        ensure_thread_safe()?;
        let conn = Connection::open_in_memory_with_flags(open_flags()).map_err(|source| {
            StoreError::Open {
                path: ":memory:".into(),
                source,
            }
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
        })
    }

    /// Open the measurement database and apply its migrations
    pub fn open_history(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self::open(path)?;
        store.migrate(HISTORY_MIGRATIONS)?;
        Ok(store)
    }

    /// Open the script database and apply its migrations
    pub fn open_scripts(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self::open(path)?;
        store.migrate(SCRIPT_MIGRATIONS)?;
        Ok(store)
    }

    /// Apply additive migrations in order
    pub fn migrate(&self, migrations: &[Migration]) -> StoreResult<()> {
        let conn = self.conn.lock();
        for migration in migrations {
            debug!(store = %self.location, migration = migration.name, "Applying migration");
            conn.execute_batch(migration.sql)
                .map_err(|source| StoreError::Migrate {
                    name: migration.name,
                    source,
                })?;
        }
        Ok(())
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}
