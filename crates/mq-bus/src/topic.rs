//! Topic filters and subscription bookkeeping

use mq_core::topics::MATCH_ALL;
use std::collections::BTreeSet;

use crate::error::{BusError, BusResult};

/// Check an MQTT topic filter (`+` single level, `#` trailing multi level)
pub fn validate_filter(filter: &str) -> BusResult<()> {
    let invalid = || BusError::InvalidTopic(filter.to_string());
    if filter.is_empty() {
        return Err(invalid());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        match *level {
            "#" if is_last => {}
            "+" => {}
            l if l.contains('#') || l.contains('+') => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// The filters a client currently holds
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    filters: BTreeSet<String>,
}

impl SubscriptionSet {
    /// Track a filter; false when it was already held
    pub fn insert(&mut self, filter: &str) -> bool {
        self.filters.insert(filter.to_string())
    }

    /// Stop tracking a filter and return what has to be unsubscribed
    ///
    /// `#` releases every held filter.
    pub fn remove(&mut self, filter: &str) -> Vec<String> {
        if filter == MATCH_ALL {
            return std::mem::take(&mut self.filters).into_iter().collect();
        }
        if self.filters.remove(filter) {
            vec![filter.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
