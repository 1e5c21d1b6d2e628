//! Measurement tables: dimension rows, samples and the latest-value view

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreResult;
use crate::store::Store;

/// Surrogate key of a dimension row
pub type RowId = i64;

/// Text form used for sample timestamps, sortable and SQLite date compatible
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// One row of the `valsensor` view
#[derive(Debug, Clone, PartialEq)]
pub struct LatestSample {
    pub sensor: String,
    pub value_name: String,
    pub timestamp: String,
    pub value: f64,
}

fn ensure_named(
    conn: &Connection,
    insert: &str,
    select: &str,
    name: &str,
) -> rusqlite::Result<RowId> {
    conn.prepare_cached(insert)?.execute(params![name])?;
    conn.prepare_cached(select)?
        .query_row(params![name], |row| row.get(0))
}

impl Store {
    /// Id of the sensor row for `name`, created on first sight
    pub fn ensure_sensor(&self, name: &str) -> StoreResult<RowId> {
        self.with_connection(|conn| {
            ensure_named(
                conn,
                "INSERT INTO sensor (name) VALUES (?1) ON CONFLICT (name) DO NOTHING",
                "SELECT id FROM sensor WHERE name = ?1",
                name,
            )
        })
    }

    /// Id of the unit row for `name`, created on first sight
    pub fn ensure_unit(&self, name: &str) -> StoreResult<RowId> {
        self.with_connection(|conn| {
            ensure_named(
                conn,
                "INSERT INTO unit (name) VALUES (?1) ON CONFLICT (name) DO NOTHING",
                "SELECT id FROM unit WHERE name = ?1",
                name,
            )
        })
    }

    /// Id of the value name row for `name`
    ///
    /// The unit is bound when the row is created; later calls with another
    /// unit return the existing row unchanged.
    pub fn ensure_value_name(&self, name: &str, unit_id: RowId) -> StoreResult<RowId> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "INSERT INTO valname (name, unit_id) VALUES (?1, ?2) ON CONFLICT (name) DO NOTHING",
            )?
            .execute(params![name, unit_id])?;
            conn.prepare_cached("SELECT id FROM valname WHERE name = ?1")?
                .query_row(params![name], |row| row.get(0))
        })
    }

    /// Unit string bound to a value name
    pub fn value_name_unit(&self, name: &str) -> StoreResult<Option<String>> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "SELECT unit.name FROM valname JOIN unit ON unit.id = valname.unit_id
                 WHERE valname.name = ?1",
            )?
            .query_row(params![name], |row| row.get(0))
            .optional()
        })
    }

    /// Append a real sample; the trigger refreshes `valsensor` in the same statement
    pub fn insert_real(
        &self,
        at: &DateTime<Utc>,
        sensor_id: RowId,
        valname_id: RowId,
        value: f64,
    ) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "INSERT INTO valreal (timestamp, sensor_id, valname_id, value) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![format_timestamp(at), sensor_id, valname_id, value])?;
            Ok(())
        })
    }

    pub fn insert_bool(
        &self,
        at: &DateTime<Utc>,
        sensor_id: RowId,
        valname_id: RowId,
        value: bool,
    ) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "INSERT INTO valbool (timestamp, sensor_id, valname_id, value) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![format_timestamp(at), sensor_id, valname_id, value])?;
            Ok(())
        })
    }

    /// Most recent real sample of a value, used to seed the writer at startup
    pub fn latest_real(&self, sensor: &str, value_name: &str) -> StoreResult<Option<f64>> {
        self.with_connection(|conn| {
            conn.prepare_cached(
                "SELECT valreal.value FROM valreal
                 JOIN sensor ON sensor.id = valreal.sensor_id
                 JOIN valname ON valname.id = valreal.valname_id
                 WHERE sensor.name = ?1 AND valname.name = ?2
                 ORDER BY valreal.timestamp DESC LIMIT 1",
            )?
            .query_row(params![sensor, value_name], |row| row.get(0))
            .optional()
        })
    }

    /// Real samples of a value in chronological order
    pub fn real_samples(&self, sensor: &str, value_name: &str) -> StoreResult<Vec<(String, f64)>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT valreal.timestamp, valreal.value FROM valreal
                 JOIN sensor ON sensor.id = valreal.sensor_id
                 JOIN valname ON valname.id = valreal.valname_id
                 WHERE sensor.name = ?1 AND valname.name = ?2
                 ORDER BY valreal.timestamp",
            )?;
            let rows = stmt
                .query_map(params![sensor, value_name], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect();
            rows
        })
    }

    /// Boolean samples of a value in chronological order
    pub fn bool_samples(&self, sensor: &str, value_name: &str) -> StoreResult<Vec<(String, bool)>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT valbool.timestamp, valbool.value FROM valbool
                 JOIN sensor ON sensor.id = valbool.sensor_id
                 JOIN valname ON valname.id = valbool.valname_id
                 WHERE sensor.name = ?1 AND valname.name = ?2
                 ORDER BY valbool.timestamp",
            )?;
            let rows = stmt
                .query_map(params![sensor, value_name], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect();
            rows
        })
    }

    /// Every row of the latest-value view
    pub fn latest_by_value(&self) -> StoreResult<Vec<LatestSample>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT sensor.name, valname.name, valsensor.timestamp, valsensor.value
                 FROM valsensor
                 JOIN sensor ON sensor.id = valsensor.sensor_id
                 JOIN valname ON valname.id = valsensor.valname_id
                 ORDER BY sensor.name, valname.name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(LatestSample {
                        sensor: row.get(0)?,
                        value_name: row.get(1)?,
                        timestamp: row.get(2)?,
                        value: row.get(3)?,
                    })
                })?
                .collect();
            rows
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::HISTORY_MIGRATIONS;
    use chrono::{Duration, TimeZone};

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.migrate(HISTORY_MIGRATIONS).unwrap();
        store
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_format_timestamp() {
        let ts = at(0) + Duration::microseconds(1500);
        assert_eq!(format_timestamp(&ts), "2024-03-01 12:00:00.001500");
    }

    #[test]
    fn test_dimension_rows_are_stable() {
        let store = store();
        let a = store.ensure_sensor("A/B").unwrap();
        let b = store.ensure_sensor("C").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.ensure_sensor("A/B").unwrap(), a);

        let empty = store.ensure_unit("").unwrap();
        let watt = store.ensure_unit("W").unwrap();
        assert_ne!(empty, watt);
        assert_eq!(store.ensure_unit("").unwrap(), empty);
    }

    #[test]
    fn test_value_name_unit_is_fixed_at_first_sight() {
        let store = store();
        let watt = store.ensure_unit("W").unwrap();
        let milliwatt = store.ensure_unit("mW").unwrap();

        let first = store.ensure_value_name("P", watt).unwrap();
        let second = store.ensure_value_name("P", milliwatt).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.value_name_unit("P").unwrap().as_deref(), Some("W"));
    }

    #[test]
    fn test_trigger_tracks_latest_real_sample() {
        let store = store();
        let sensor = store.ensure_sensor("A/B").unwrap();
        let unit = store.ensure_unit("°C").unwrap();
        let temp = store.ensure_value_name("Temperature", unit).unwrap();

        store.insert_real(&at(0), sensor, temp, 20.0).unwrap();
        store.insert_real(&at(10), sensor, temp, 21.0).unwrap();
        // A late sample does not replace the newer one
        store.insert_real(&at(5), sensor, temp, 99.0).unwrap();

        let latest = store.latest_by_value().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].sensor, "A/B");
        assert_eq!(latest[0].value_name, "Temperature");
        assert_eq!(latest[0].value, 21.0);
        assert_eq!(latest[0].timestamp, format_timestamp(&at(10)));

        assert_eq!(store.latest_real("A/B", "Temperature").unwrap(), Some(21.0));
        assert_eq!(store.real_samples("A/B", "Temperature").unwrap().len(), 3);
    }

    #[test]
    fn test_bool_samples_do_not_touch_latest_view() {
        let store = store();
        let sensor = store.ensure_sensor("A/B").unwrap();
        let unit = store.ensure_unit("").unwrap();
        let door = store.ensure_value_name("Door", unit).unwrap();

        store.insert_bool(&at(0), sensor, door, true).unwrap();
        store.insert_bool(&at(1), sensor, door, false).unwrap();

        assert_eq!(
            store.bool_samples("A/B", "Door").unwrap(),
            vec![
                (format_timestamp(&at(0)), true),
                (format_timestamp(&at(1)), false)
            ]
        );
        assert!(store.latest_by_value().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_timestamp_is_rejected() {
        let store = store();
        let sensor = store.ensure_sensor("A").unwrap();
        let unit = store.ensure_unit("").unwrap();
        let v = store.ensure_value_name("V", unit).unwrap();

        store.insert_real(&at(0), sensor, v, 1.0).unwrap();
        assert!(store.insert_real(&at(0), sensor, v, 2.0).is_err());
        assert_eq!(store.latest_real("A", "V").unwrap(), Some(1.0));
    }

    #[test]
    fn test_latest_real_absent() {
        let store = store();
        assert_eq!(store.latest_real("A", "V").unwrap(), None);
    }
}
