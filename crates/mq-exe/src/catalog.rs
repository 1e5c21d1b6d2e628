//! Script catalog backed by the `script` table

use mq_core::{DevicePath, ValueRef};
use mq_store::Store;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ExeError, ExeResult, ScanResult};
use crate::scanner::ScriptScanner;

/// A stored script that passed the static scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub body: String,
    /// Literal `register_value` arguments, in first-seen order
    pub references: Vec<ValueRef>,
}

impl Script {
    pub fn devices(&self) -> impl Iterator<Item = &DevicePath> {
        self.references.iter().map(ValueRef::device)
    }
}

/// Devices mentioned by any script
pub fn devices_of(scripts: &[Script]) -> BTreeSet<DevicePath> {
    scripts.iter().flat_map(Script::devices).cloned().collect()
}

pub struct ScriptCatalog {
    store: Arc<Store>,
    scanner: ScriptScanner,
}

impl ScriptCatalog {
    pub fn new(store: Arc<Store>) -> ExeResult<Self> {
        Ok(Self {
            store,
            scanner: ScriptScanner::new()?,
        })
    }

    pub fn scan(&self, body: &str) -> ScanResult<Vec<ValueRef>> {
        self.scanner.scan(body)
    }

    /// Every stored script that passes the scan; rejected ones are logged and skipped
    pub fn load(&self) -> ExeResult<Vec<Script>> {
        let records = self.store.list_scripts()?;
        let total = records.len();

        let scripts: Vec<Script> = records
            .into_iter()
            .filter_map(|record| match self.scanner.scan(&record.body) {
                Ok(references) => {
                    debug!(script = %record.name, values = references.len(), "Scanned script");
                    Some(Script {
                        name: record.name,
                        body: record.body,
                        references,
                    })
                }
                Err(e) => {
                    warn!(script = %record.name, error = %e, "Script rejected by scan");
                    None
                }
            })
            .collect();

        info!(loaded = scripts.len(), rejected = total - scripts.len(), "Loaded scripts");
        Ok(scripts)
    }

    /// Scan and store a script, replacing any previous body
    pub fn save(&self, name: &str, body: &str) -> ExeResult<Script> {
        let references = self.scanner.scan(body).map_err(|source| ExeError::Scan {
            name: name.to_string(),
            source,
        })?;
        self.store.put_script(name, body)?;
        info!(script = name, "Stored script");
        Ok(Script {
            name: name.to_string(),
            body: body.to_string(),
            references,
        })
    }

    /// Delete a script; returns whether it existed
    pub fn remove(&self, name: &str) -> ExeResult<bool> {
        let removed = self.store.delete_script(name)?;
        if removed {
            info!(script = name, "Removed script");
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> ExeResult<Option<String>> {
        Ok(self.store.get_script(name)?.map(|record| record.body))
    }

    /// Names of every stored script, scanned or not
    pub fn names(&self) -> ExeResult<Vec<String>> {
        Ok(self
            .store
            .list_scripts()?
            .into_iter()
            .map(|record| record.name)
            .collect())
    }
}
