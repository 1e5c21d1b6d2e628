//! Process-wide variables shared between scripts

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_core::Scalar;

use crate::error::GlobalError;

/// Boolean and numeric globals keyed by name
#[derive(Debug, Default)]
pub struct Globals {
    values: DashMap<String, Scalar>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a global; a name never changes between boolean and number
    pub fn set(&self, name: &str, value: Scalar) -> Result<(), GlobalError> {
        if let Scalar::Str(_) = value {
            return Err(GlobalError::Unsupported("string"));
        }
        match self.values.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_number() != value.is_number() {
                    return Err(GlobalError::TypeChange {
                        name: name.to_string(),
                        from: slot.get().type_name(),
                        to: value.type_name(),
                    });
                }
                slot.insert(value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Scalar> {
        self.values.get(name).map(|entry| entry.value().clone())
    }
}
