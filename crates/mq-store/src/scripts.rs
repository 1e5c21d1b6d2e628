//! Script table

use rusqlite::{params, OptionalExtension};

use crate::error::StoreResult;
use crate::store::Store;

/// A stored rule-engine script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRecord {
    pub name: String,
    pub body: String,
}

impl Store {
    /// All scripts ordered by name
    pub fn list_scripts(&self) -> StoreResult<Vec<ScriptRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached("SELECT name, body FROM script ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ScriptRecord {
                        name: row.get(0)?,
                        body: row.get(1)?,
                    })
                })?
                .collect();
            rows
        })
    }

    pub fn get_script(&self, name: &str) -> StoreResult<Option<ScriptRecord>> {
        self.with_connection(|conn| {
            conn.prepare_cached("SELECT name, body FROM script WHERE name = ?1")?
                .query_row(params![name], |row| {
                    Ok(ScriptRecord {
                        name: row.get(0)?,
                        body: row.get(1)?,
                    })
                })
                .optional()
        })
    }

    /// Insert or replace a script body
    pub fn put_script(&self, name: &str, body: &str) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "INSERT INTO script (name, body) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET body = excluded.body",
            )?
            .execute(params![name, body])?;
            Ok(())
        })
    }

    /// Remove a script; returns whether it existed
    pub fn delete_script(&self, name: &str) -> StoreResult<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .prepare_cached("DELETE FROM script WHERE name = ?1")?
                .execute(params![name])?;
            Ok(removed > 0)
        })
    }
}
