//! Last observed value per reference

use dashmap::DashMap;
use mq_core::{Scalar, ValueRef};

/// Most recent boolean or numeric reading of every value seen on the bus
#[derive(Debug, Default)]
pub struct ValueCache {
    values: DashMap<ValueRef, Scalar>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading; strings are not cached and return false
    pub fn update(&self, value: ValueRef, reading: Scalar) -> bool {
        if let Scalar::Str(_) = reading {
            return false;
        }
        self.values.insert(value, reading);
        true
    }

    pub fn get(&self, value: &ValueRef) -> Option<Scalar> {
        self.values.get(value).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
