//! Additive schema migrations
//!
//! Every statement is idempotent, so the full list runs on each open.
//! Columns added later must be nullable.

/// A named schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Measurement tables written by the history writer
pub const HISTORY_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "sensor",
        sql: "CREATE TABLE IF NOT EXISTS sensor (
                id   INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )",
    },
    Migration {
        name: "unit",
        sql: "CREATE TABLE IF NOT EXISTS unit (
                id   INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )",
    },
    Migration {
        name: "valname",
        sql: "CREATE TABLE IF NOT EXISTS valname (
                id      INTEGER PRIMARY KEY,
                name    TEXT NOT NULL UNIQUE,
                unit_id INTEGER REFERENCES unit(id)
            )",
    },
    Migration {
        name: "valreal",
        sql: "CREATE TABLE IF NOT EXISTS valreal (
                timestamp  TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
                sensor_id  INTEGER NOT NULL REFERENCES sensor(id),
                valname_id INTEGER NOT NULL REFERENCES valname(id),
                value      REAL,
                PRIMARY KEY (timestamp, sensor_id, valname_id)
            )",
    },
    Migration {
        name: "valbool",
        sql: "CREATE TABLE IF NOT EXISTS valbool (
                timestamp  TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
                sensor_id  INTEGER NOT NULL REFERENCES sensor(id),
                valname_id INTEGER NOT NULL REFERENCES valname(id),
                value      BOOLEAN,
                PRIMARY KEY (timestamp, sensor_id, valname_id)
            )",
    },
    Migration {
        name: "valsensor",
        sql: "CREATE TABLE IF NOT EXISTS valsensor (
                valname_id INTEGER NOT NULL REFERENCES valname(id),
                sensor_id  INTEGER NOT NULL REFERENCES sensor(id),
                timestamp  TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
                value      REAL,
                PRIMARY KEY (valname_id, sensor_id)
            )",
    },
    Migration {
        name: "valsensor_valreal_trigger",
        // Late inserts of older samples never overwrite a newer latest value.
        sql: "CREATE TRIGGER IF NOT EXISTS valsensor_valreal_trigger
              AFTER INSERT ON valreal
              BEGIN
                INSERT INTO valsensor (valname_id, sensor_id, timestamp, value)
                VALUES (NEW.valname_id, NEW.sensor_id, NEW.timestamp, NEW.value)
                ON CONFLICT (valname_id, sensor_id) DO UPDATE
                  SET timestamp = excluded.timestamp, value = excluded.value
                  WHERE excluded.timestamp >= valsensor.timestamp;
              END",
    },
];

/// Script table owned by the rule engine catalog
pub const SCRIPT_MIGRATIONS: &[Migration] = &[Migration {
    name: "script",
    sql: "CREATE TABLE IF NOT EXISTS script (
            name TEXT PRIMARY KEY,
            body TEXT NOT NULL
        )",
}];
