//! The history writer
//!
//! Runs synchronously on the bus thread. For every message on a configured
//! `status/<device-path>` topic it applies the sensor cadence gate, then per
//! value the interval, averaging and precision rules, and appends the
//! resulting samples to the store.

use mq_config::{SensorSettings, ValueSettings};
use mq_core::topics::STATUS_PREFIX;
use mq_core::{decode, DevicePath, Scalar};
use mq_store::{RowId, Store, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::sampling::{sensor_cadence, time_weighted_mean, Stamp};

struct ValueState {
    settings: ValueSettings,
    last_persisted: Option<f64>,
    last_persisted_at: Option<Instant>,
    pending: Vec<(Instant, f64)>,
}

impl ValueState {
    fn new(settings: ValueSettings) -> Self {
        Self {
            settings,
            last_persisted: None,
            last_persisted_at: None,
            pending: Vec::new(),
        }
    }

    fn reseed(&mut self, at: Instant, value: f64) {
        self.pending.clear();
        self.pending.push((at, value));
    }
}

struct SensorState {
    device: DevicePath,
    cadence: Duration,
    last_persisted_at: Option<Instant>,
    values: HashMap<String, ValueState>,
}

/// What happened to one value of a message
enum Decision {
    Skip,
    Write(Scalar),
}

/// Down-samples readings and appends them to the measurement tables
pub struct HistoryWriter {
    store: Arc<Store>,
    /// Keyed by status topic
    sensors: HashMap<String, SensorState>,
    sensor_ids: HashMap<String, RowId>,
    unit_ids: HashMap<String, RowId>,
    valname_ids: HashMap<String, RowId>,
}

fn elapsed(since: Option<Instant>, now: Instant) -> Option<Duration> {
    since.map(|t| now.saturating_duration_since(t))
}

impl HistoryWriter {
    pub fn new(store: Arc<Store>, sensors: &[SensorSettings]) -> Self {
        let sensors = sensors
            .iter()
            .map(|sensor| {
                let cadence = sensor_cadence(&sensor.values);
                debug!(sensor = %sensor.device, cadence = ?cadence, "Configured sensor");
                let values = sensor
                    .values
                    .iter()
                    .map(|v| (v.name.clone(), ValueState::new(v.clone())))
                    .collect();
                let state = SensorState {
                    device: sensor.device.clone(),
                    cadence,
                    last_persisted_at: None,
                    values,
                };
                (sensor.device.status_topic(), state)
            })
            .collect();

        Self {
            store,
            sensors,
            sensor_ids: HashMap::new(),
            unit_ids: HashMap::new(),
            valname_ids: HashMap::new(),
        }
    }

    /// Seed the precision baseline from the latest stored real sample of each value
    #[instrument(skip(self))]
    pub fn seed(&mut self) -> StoreResult<()> {
        let mut seeded = 0;
        for sample in self.store.latest_by_value()? {
            let topic = format!("{STATUS_PREFIX}{}", sample.sensor);
            let Some(value) = self
                .sensors
                .get_mut(&topic)
                .and_then(|sensor| sensor.values.get_mut(&sample.value_name))
            else {
                continue;
            };
            trace!(
                sensor = %sample.sensor,
                value = %sample.value_name,
                last = sample.value,
                at = %sample.timestamp,
                "Seeded last value"
            );
            value.last_persisted = Some(sample.value);
            seeded += 1;
        }
        info!(seeded, "Seeded values from history");
        Ok(())
    }

    /// Status topics the writer needs to receive
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.sensors.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Bus callback entry point
    pub fn handle_message(&mut self, topic: &str, payload: &str) {
        self.record(topic, payload, Stamp::now());
    }

    /// Process one message observed at `now`; returns the number of rows written
    pub fn record(&mut self, topic: &str, payload: &str, now: Stamp) -> usize {
        let Some(sensor) = self.sensors.get_mut(topic) else {
            trace!(topic, "Not a recorded sensor");
            return 0;
        };

        if !sensor.cadence.is_zero() {
            if let Some(since) = elapsed(sensor.last_persisted_at, now.mono) {
                if since < sensor.cadence {
                    trace!(sensor = %sensor.device, ?since, "Within sensor cadence, dropped");
                    return 0;
                }
            }
        }

        let message = match decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic, error = %e, payload, "Malformed envelope");
                return 0;
            }
        };

        let mut written = 0;
        for (name, reading) in message {
            let Some(value) = sensor.values.get_mut(&name) else {
                continue;
            };

            // Dimension rows exist for every configured value seen, written or not
            let ids = resolve_ids(
                &self.store,
                &mut self.sensor_ids,
                &mut self.unit_ids,
                &mut self.valname_ids,
                sensor.device.as_str(),
                reading.unit_or_empty(),
                &name,
            );
            let (sensor_id, valname_id) = match ids {
                Ok(ids) => ids,
                Err(e) => {
                    error!(sensor = %sensor.device, value = %name, error = %e, "Failed to resolve dimension rows");
                    continue;
                }
            };

            let Decision::Write(scalar) = decide(&sensor.device, value, &reading.value, now.mono)
            else {
                continue;
            };

            let result = match scalar {
                Scalar::Bool(b) => self.store.insert_bool(&now.wall, sensor_id, valname_id, b),
                ref number => {
                    let v = number.as_f64().unwrap_or(f64::NAN);
                    self.store.insert_real(&now.wall, sensor_id, valname_id, v)
                }
            };

            match result {
                Ok(()) => {
                    debug!(sensor = %sensor.device, value = %name, sample = %scalar, "Stored sample");
                    if let Some(v) = scalar.as_f64() {
                        value.last_persisted = Some(v);
                        value.reseed(now.mono, v);
                    }
                    value.last_persisted_at = Some(now.mono);
                    sensor.last_persisted_at = Some(now.mono);
                    written += 1;
                }
                Err(e) => {
                    error!(sensor = %sensor.device, value = %name, error = %e, "Failed to store sample");
                }
            }
        }
        written
    }
}

/// Apply the interval, averaging and precision rules to one value
///
/// Suppressed and buffered samples update the value state here; the state
/// for written samples is only committed after the store accepted the row.
fn decide(device: &DevicePath, value: &mut ValueState, scalar: &Scalar, now: Instant) -> Decision {
    let settings = &value.settings;

    let number = match scalar {
        Scalar::Bool(_) => return Decision::Write(scalar.clone()),
        Scalar::Int(_) | Scalar::Float(_) => scalar.as_f64().unwrap_or(f64::NAN),
        Scalar::Str(_) => {
            warn!(sensor = %device, value = %settings.name, "Unsupported payload type, dropped");
            return Decision::Skip;
        }
    };

    if settings.averaging {
        let first_pending = value.pending.first().map(|(t, _)| *t);
        if let Some(since) = elapsed(first_pending, now) {
            if since < settings.interval {
                value.pending.push((now, number));
                trace!(sensor = %device, value = %settings.name, pending = value.pending.len(), "Buffered for averaging");
                return Decision::Skip;
            }
        }
    } else if !settings.interval.is_zero() {
        if let Some(since) = elapsed(value.last_persisted_at, now) {
            if since < settings.interval {
                return Decision::Skip;
            }
        }
    }

    let mut effective = Scalar::Float(number);
    if settings.averaging && !value.pending.is_empty() {
        value.pending.push((now, number));
        if let Some(mean) = time_weighted_mean(&value.pending) {
            debug!(sensor = %device, value = %settings.name, samples = value.pending.len(), mean, "Averaged");
            effective = Scalar::Float(mean);
        } else {
            effective = scalar.clone();
        }
    } else if let Scalar::Int(_) = scalar {
        effective = scalar.clone();
    }

    let effective_value = effective.as_f64().unwrap_or(number);
    if settings.precision > 0.0 {
        if let Some(last) = value.last_persisted {
            if (effective_value - last).abs() < settings.precision {
                debug!(sensor = %device, value = %settings.name, last, current = effective_value, "Below precision, suppressed");
                value.reseed(now, effective_value);
                return Decision::Skip;
            }
        }
    }

    Decision::Write(effective)
}

fn resolve_ids(
    store: &Store,
    sensor_ids: &mut HashMap<String, RowId>,
    unit_ids: &mut HashMap<String, RowId>,
    valname_ids: &mut HashMap<String, RowId>,
    device: &str,
    unit: &str,
    name: &str,
) -> StoreResult<(RowId, RowId)> {
    let sensor_id = cached(sensor_ids, device, |n| store.ensure_sensor(n))?;
    let unit_id = cached(unit_ids, unit, |n| store.ensure_unit(n))?;
    let valname_id = cached(valname_ids, name, |n| store.ensure_value_name(n, unit_id))?;
    Ok((sensor_id, valname_id))
}

fn cached(
    cache: &mut HashMap<String, RowId>,
    name: &str,
    create: impl FnOnce(&str) -> StoreResult<RowId>,
) -> StoreResult<RowId> {
    if let Some(id) = cache.get(name) {
        return Ok(*id);
    }
    let id = create(name)?;
    cache.insert(name.to_string(), id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_store::HISTORY_MIGRATIONS;

    fn store() -> Arc<Store> {
        let store = Store::open_in_memory().unwrap();
        store.migrate(HISTORY_MIGRATIONS).unwrap();
        Arc::new(store)
    }

    fn sensor(device: &str, values: Vec<ValueSettings>) -> SensorSettings {
        SensorSettings {
            device: DevicePath::new(device).unwrap(),
            values,
        }
    }

    fn value(name: &str, interval_secs: u64, averaging: bool, precision: f64) -> ValueSettings {
        ValueSettings {
            name: name.to_string(),
            interval: Duration::from_secs(interval_secs),
            averaging,
            precision,
        }
    }

    fn values(store: &Store, device: &str, name: &str) -> Vec<f64> {
        store
            .real_samples(device, name)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn test_unconfigured_topic_is_dropped() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A/B", vec![value("T", 0, false, 0.0)])]);
        assert_eq!(writer.record("status/X", r#"{"T":1.0}"#, Stamp::now()), 0);
        assert!(store.latest_by_value().unwrap().is_empty());
    }

    #[test]
    fn test_unconfigured_value_is_dropped() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A/B", vec![value("T", 0, false, 0.0)])]);
        assert_eq!(writer.record("status/A/B", r#"{"H":55.0,"T":21.0}"#, Stamp::now()), 1);
        assert!(values(&store, "A/B", "H").is_empty());
        assert_eq!(values(&store, "A/B", "T"), vec![21.0]);
    }

    #[test]
    fn test_malformed_envelope_is_skipped() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("T", 0, false, 0.0)])]);
        assert_eq!(writer.record("status/A", "[1,2]", Stamp::now()), 0);
        assert_eq!(writer.record("status/A", "{broken", Stamp::now()), 0);
    }

    #[test]
    fn test_string_payload_is_dropped() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("Mode", 0, false, 0.0)])]);
        assert_eq!(writer.record("status/A", r#"{"Mode":"auto"}"#, Stamp::now()), 0);
    }

    #[test]
    fn test_interval_gate_without_averaging() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("T", 10, false, 0.0)])]);
        let t0 = Stamp::now();
        for (secs, v) in [(0, 1.0), (4, 2.0), (9, 3.0), (10, 4.0), (15, 5.0), (21, 6.0)] {
            writer.record("status/A", &format!(r#"{{"T":{v:?}}}"#), t0.after(Duration::from_secs(secs)));
        }
        assert_eq!(values(&store, "A", "T"), vec![1.0, 4.0, 6.0]);
    }

    #[test]
    fn test_booleans_bypass_value_interval() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("Door", 60, true, 0.0)])]);
        let t0 = Stamp::now();
        writer.record("status/A", r#"{"Door":true}"#, t0);
        writer.record("status/A", r#"{"Door":false}"#, t0.after(Duration::from_secs(1)));

        let rows: Vec<bool> = store
            .bool_samples("A", "Door")
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(rows, vec![true, false]);
    }

    #[test]
    fn test_integer_payload_is_stored_as_real() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("Count", 0, false, 0.0)])]);
        writer.record("status/A", r#"{"Count":[7,"pcs"]}"#, Stamp::now());
        assert_eq!(values(&store, "A", "Count"), vec![7.0]);
        assert_eq!(store.value_name_unit("Count").unwrap().as_deref(), Some("pcs"));
    }

    #[test]
    fn test_seed_sets_precision_baseline() {
        let store = store();
        let config = [sensor("A", vec![value("T", 0, false, 0.5)])];
        {
            let mut writer = HistoryWriter::new(store.clone(), &config);
            writer.record("status/A", r#"{"T":20.0}"#, Stamp::now());
        }

        let mut writer = HistoryWriter::new(store.clone(), &config);
        writer.seed().unwrap();
        let t0 = Stamp::now().after(Duration::from_secs(1));
        assert_eq!(writer.record("status/A", r#"{"T":20.2}"#, t0), 0);
        assert_eq!(writer.record("status/A", r#"{"T":20.6}"#, t0.after(Duration::from_secs(1))), 1);
        assert_eq!(values(&store, "A", "T"), vec![20.0, 20.6]);
    }

    #[test]
    fn test_failed_write_keeps_baseline() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("T", 0, false, 0.5)])]);
        let t0 = Stamp::now();
        assert_eq!(writer.record("status/A", r#"{"T":20.0}"#, t0), 1);
        // Same wall timestamp collides on the primary key
        assert_eq!(writer.record("status/A", r#"{"T":30.0}"#, t0), 0);
        // 20.3 is still measured against 20.0
        assert_eq!(writer.record("status/A", r#"{"T":20.3}"#, t0.after(Duration::from_secs(1))), 0);
        assert_eq!(values(&store, "A", "T"), vec![20.0]);
    }

    fn unit_names(store: &Store) -> Vec<String> {
        store
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM unit ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .unwrap()
    }

    #[test]
    fn test_unresolved_value_does_not_drop_the_rest() {
        let store = store();
        let mut writer = HistoryWriter::new(
            store.clone(),
            &[sensor("A", vec![value("P", 0, false, 0.0), value("T", 0, false, 0.0)])],
        );
        let t0 = Stamp::now();
        assert_eq!(writer.record("status/A", r#"{"T":[1.0,"°C"]}"#, t0), 1);

        // P needs a new unit row, T is already resolved
        store
            .with_connection(|conn| conn.execute_batch("PRAGMA foreign_keys = OFF; DROP TABLE unit"))
            .unwrap();
        let payload = r#"{"P":[900.0,"hPa"],"T":[2.0,"°C"]}"#;
        assert_eq!(writer.record("status/A", payload, t0.after(Duration::from_secs(1))), 1);
        assert_eq!(values(&store, "A", "T"), vec![1.0, 2.0]);
        assert!(values(&store, "A", "P").is_empty());
    }

    #[test]
    fn test_suppressed_sample_still_registers_unit() {
        let store = store();
        let mut writer = HistoryWriter::new(store.clone(), &[sensor("A", vec![value("T", 0, false, 0.5)])]);
        let t0 = Stamp::now();
        assert_eq!(writer.record("status/A", r#"{"T":[20.0,"°C"]}"#, t0), 1);
        assert_eq!(writer.record("status/A", r#"{"T":[20.1,"K"]}"#, t0.after(Duration::from_secs(1))), 0);

        assert_eq!(unit_names(&store), vec!["K", "°C"]);
        assert_eq!(values(&store, "A", "T"), vec![20.0]);
    }

    #[test]
    fn test_topics() {
        let writer = HistoryWriter::new(
            store(),
            &[
                sensor("B", vec![value("T", 0, false, 0.0)]),
                sensor("A/x", vec![value("T", 0, false, 0.0)]),
            ],
        );
        assert_eq!(writer.topics(), vec!["status/A/x", "status/B"]);
    }
}
