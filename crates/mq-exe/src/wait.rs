//! Wait broker
//!
//! Scripts block in [`WaitBroker::wait`] until the values and deadlines they
//! registered fire. Bus callbacks and the time scheduler fire entries; each
//! fired entry is tombstoned in place and later removed by its owner.
//!
//! Lock order: an index lock may be held while taking a wait signal's lock,
//! never the reverse. Condition variables are notified after the index lock
//! is released.

use chrono::{DateTime, Utc};
use mq_core::ValueRef;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::WaitError;

/// Wake condition of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Every registered value and deadline fired
    All,
    /// Any one of them fired
    Any,
}

/// Trigger counter and wake primitive of one waiting call
#[derive(Debug, Default)]
pub struct WaitSignal {
    fired: Mutex<usize>,
    condvar: Condvar,
}

impl WaitSignal {
    fn bump(&self) {
        *self.fired.lock() += 1;
    }

    fn wake(&self) {
        self.condvar.notify_all();
    }
}

/// Index slot; `signal` is `None` once fired
#[derive(Debug)]
struct Entry {
    owner: u64,
    signal: Option<Arc<WaitSignal>>,
}

impl Entry {
    fn live(owner: u64, signal: &Arc<WaitSignal>) -> Self {
        Self {
            owner,
            signal: Some(Arc::clone(signal)),
        }
    }
}

/// Tombstone every live entry, collecting the bumped signals
fn fire_entries<'a>(entries: impl Iterator<Item = &'a mut Entry>, fired: &mut Vec<Arc<WaitSignal>>) {
    for entry in entries {
        if let Some(signal) = entry.signal.take() {
            signal.bump();
            fired.push(signal);
        }
    }
}

/// Drop the owner's entries and any tombstones; true when the slot is empty
fn sweep(entries: Option<&mut Vec<Entry>>, owner: u64) -> bool {
    match entries {
        Some(list) => {
            list.retain(|e| e.owner != owner && e.signal.is_some());
            list.is_empty()
        }
        None => false,
    }
}

/// Value and deadline indices shared by the engine's threads
#[derive(Debug, Default)]
pub struct WaitBroker {
    values: Mutex<HashMap<ValueRef, Vec<Entry>>>,
    deadlines: Mutex<BTreeMap<DateTime<Utc>, Vec<Entry>>>,
    aborting: AtomicBool,
    next_owner: AtomicU64,
}

impl WaitBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the wait condition holds or the runtime aborts
    ///
    /// On return no entry of this call remains in either index.
    pub fn wait(
        &self,
        values: &[ValueRef],
        deadlines: &[DateTime<Utc>],
        mode: WaitMode,
    ) -> Result<(), WaitError> {
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(WaitSignal::default());
        let expected = match mode {
            WaitMode::All => values.len() + deadlines.len(),
            WaitMode::Any => 1,
        };

        if !values.is_empty() {
            let mut index = self.values.lock();
            for value in values {
                index
                    .entry(value.clone())
                    .or_default()
                    .push(Entry::live(owner, &signal));
            }
        }
        if !deadlines.is_empty() {
            let mut index = self.deadlines.lock();
            for deadline in deadlines {
                index
                    .entry(*deadline)
                    .or_default()
                    .push(Entry::live(owner, &signal));
            }
        }
        trace!(owner, values = values.len(), deadlines = deadlines.len(), ?mode, "Waiting");

        {
            let mut fired = signal.fired.lock();
            while !self.is_aborting() && *fired < expected {
                signal.condvar.wait(&mut fired);
            }
        }

        self.remove_owner(owner, values, deadlines);

        if self.is_aborting() {
            trace!(owner, "Wait aborted");
            return Err(WaitError::Aborted);
        }
        trace!(owner, "Wait satisfied");
        Ok(())
    }

    fn remove_owner(&self, owner: u64, values: &[ValueRef], deadlines: &[DateTime<Utc>]) {
        if !values.is_empty() {
            let mut index = self.values.lock();
            for value in values {
                if sweep(index.get_mut(value), owner) {
                    index.remove(value);
                }
            }
        }
        if !deadlines.is_empty() {
            let mut index = self.deadlines.lock();
            for deadline in deadlines {
                if sweep(index.get_mut(deadline), owner) {
                    index.remove(deadline);
                }
            }
        }
    }

    /// Fire every wait registered on `value`; returns the number woken
    pub fn notify_value(&self, value: &ValueRef) -> usize {
        let mut fired = Vec::new();
        {
            let mut index = self.values.lock();
            if let Some(entries) = index.get_mut(value) {
                fire_entries(entries.iter_mut(), &mut fired);
            }
        }
        for signal in &fired {
            signal.wake();
        }
        if !fired.is_empty() {
            debug!(value = %value, woken = fired.len(), "Value fired waits");
        }
        fired.len()
    }

    /// Fire every wait whose deadline is at or before `now`
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut fired = Vec::new();
        {
            let mut index = self.deadlines.lock();
            fire_entries(
                index.range_mut(..=now).flat_map(|(_, entries)| entries.iter_mut()),
                &mut fired,
            );
        }
        for signal in &fired {
            signal.wake();
        }
        if !fired.is_empty() {
            debug!(woken = fired.len(), "Deadlines fired waits");
        }
        fired.len()
    }

    /// Raise the abort flag and wake every registered wait
    pub fn abort_all(&self) {
        self.aborting.store(true, Ordering::SeqCst);

        let mut woken = Vec::new();
        {
            let index = self.values.lock();
            for signal in index.values().flatten().filter_map(|e| e.signal.as_ref()) {
                signal.bump();
                woken.push(Arc::clone(signal));
            }
        }
        {
            let index = self.deadlines.lock();
            for signal in index.values().flatten().filter_map(|e| e.signal.as_ref()) {
                signal.bump();
                woken.push(Arc::clone(signal));
            }
        }
        for signal in &woken {
            signal.wake();
        }
        debug!(woken = woken.len(), "Abort requested");
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    /// Clear the abort flag and both indices once every script has stopped
    pub fn reset(&self) {
        self.values.lock().clear();
        self.deadlines.lock().clear();
        self.aborting.store(false, Ordering::SeqCst);
    }

    /// Entries currently held in the value index, tombstones included
    pub fn value_entries(&self) -> usize {
        self.values.lock().values().map(Vec::len).sum()
    }

    /// Entries currently held in the deadline index, tombstones included
    pub fn deadline_entries(&self) -> usize {
        self.deadlines.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::thread;
    use std::time::Duration;

    fn value(text: &str) -> ValueRef {
        text.parse().unwrap()
    }

    /// Spin until `cond` holds or a generous timeout passes
    fn eventually(cond: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn spawn_wait(
        broker: &Arc<WaitBroker>,
        values: Vec<ValueRef>,
        deadlines: Vec<DateTime<Utc>>,
        mode: WaitMode,
    ) -> thread::JoinHandle<Result<(), WaitError>> {
        let broker = Arc::clone(broker);
        thread::spawn(move || broker.wait(&values, &deadlines, mode))
    }

    #[test]
    fn test_any_wakes_on_first_value() {
        let broker = Arc::new(WaitBroker::new());
        let door = value("A/B:Door");
        let handle = spawn_wait(&broker, vec![door.clone(), value("A/B:Window")], vec![], WaitMode::Any);

        assert!(eventually(|| broker.value_entries() == 2));
        assert_eq!(broker.notify_value(&door), 1);
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(broker.value_entries(), 0);
    }

    #[test]
    fn test_all_waits_for_every_component() {
        let broker = Arc::new(WaitBroker::new());
        let a = value("X:A");
        let b = value("X:B");
        let handle = spawn_wait(&broker, vec![a.clone(), b.clone()], vec![], WaitMode::All);

        assert!(eventually(|| broker.value_entries() == 2));
        broker.notify_value(&a);
        // Fired entries stay as tombstones until the owner wakes
        broker.notify_value(&a);
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        broker.notify_value(&b);
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(broker.value_entries(), 0);
    }

    #[test]
    fn test_value_and_deadline() {
        let broker = Arc::new(WaitBroker::new());
        let door = value("A/B:Door");
        let deadline = Utc::now() + ChronoDuration::seconds(60);
        let handle = spawn_wait(&broker, vec![door.clone()], vec![deadline], WaitMode::All);

        assert!(eventually(|| broker.deadline_entries() == 1));
        broker.notify_value(&door);
        assert_eq!(broker.fire_due(deadline - ChronoDuration::seconds(1)), 0);
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        assert_eq!(broker.fire_due(deadline), 1);
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(broker.deadline_entries(), 0);
        assert_eq!(broker.value_entries(), 0);
    }

    #[test]
    fn test_signal_before_block_is_not_lost() {
        let broker = Arc::new(WaitBroker::new());
        let past = Utc::now() - ChronoDuration::seconds(1);
        // Fire from another thread as soon as the entry appears
        let firing = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                while broker.fire_due(Utc::now()) == 0 {
                    thread::yield_now();
                }
            })
        };
        assert_eq!(broker.wait(&[], &[past], WaitMode::Any), Ok(()));
        firing.join().unwrap();
    }

    #[test]
    fn test_abort_wakes_everyone() {
        let broker = Arc::new(WaitBroker::new());
        let waits: Vec<_> = (0..4)
            .map(|i| {
                spawn_wait(
                    &broker,
                    vec![value(&format!("D:V{i}"))],
                    vec![Utc::now() + ChronoDuration::hours(1)],
                    WaitMode::All,
                )
            })
            .collect();

        assert!(eventually(|| broker.value_entries() == 4));
        broker.abort_all();
        for handle in waits {
            assert_eq!(handle.join().unwrap(), Err(WaitError::Aborted));
        }
        assert_eq!(broker.value_entries(), 0);
        assert_eq!(broker.deadline_entries(), 0);
    }

    #[test]
    fn test_wait_after_abort_fails_immediately() {
        let broker = WaitBroker::new();
        broker.abort_all();
        assert_eq!(
            broker.wait(&[value("D:V")], &[], WaitMode::Any),
            Err(WaitError::Aborted)
        );
        assert_eq!(broker.value_entries(), 0);

        broker.reset();
        assert!(!broker.is_aborting());
    }

    #[test]
    fn test_notify_without_waiters() {
        let broker = WaitBroker::new();
        assert_eq!(broker.notify_value(&value("D:V")), 0);
        assert_eq!(broker.fire_due(Utc::now()), 0);
    }
}
