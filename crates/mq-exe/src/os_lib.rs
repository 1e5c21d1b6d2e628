//! `clock`, `date`, `time` and `difftime` for scripts
//!
//! Scripts get no `os` library; these follow the Lua `os` functions of the
//! same names, computed with chrono. `clock` differs: it reports wall-clock
//! seconds since the interpreter was created, not processor time.

use chrono::format::{Item, StrftimeItems};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use mlua::{Lua, Table, Value};
use std::fmt;
use std::time::Instant;

fn runtime_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

/// Register the functions as globals of `lua`
pub fn register(lua: &Lua, started: Instant) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set(
        "clock",
        lua.create_function(move |_, ()| Ok(started.elapsed().as_secs_f64()))?,
    )?;
    globals.set("time", lua.create_function(|_, table: Option<Table>| time(table))?)?;
    globals.set(
        "date",
        lua.create_function(|lua, (format, at): (Option<String>, Option<i64>)| {
            date(lua, format.as_deref().unwrap_or("%c"), at)
        })?,
    )?;
    globals.set(
        "difftime",
        lua.create_function(|_, (t2, t1): (f64, Option<f64>)| Ok(t2 - t1.unwrap_or(0.0)))?,
    )?;
    Ok(())
}

fn field(table: &Table, key: &str, default: Option<i64>) -> mlua::Result<i64> {
    match table.get::<_, Option<i64>>(key)? {
        Some(v) => Ok(v),
        None => default.ok_or_else(|| runtime_error(format!("field '{key}' missing in date table"))),
    }
}

/// Local time described by a date table, with out-of-range fields carried
fn from_table(table: &Table) -> mlua::Result<NaiveDateTime> {
    let year = field(table, "year", None)?;
    let month = field(table, "month", None)?;
    let day = field(table, "day", None)?;
    let hour = field(table, "hour", Some(12))?;
    let min = field(table, "min", Some(0))?;
    let sec = field(table, "sec", Some(0))?;

    let months = year
        .checked_mul(12)
        .and_then(|m| month.checked_sub(1).and_then(|offset| m.checked_add(offset)))
        .ok_or_else(|| runtime_error("date table out of range"))?;
    let first = i32::try_from(months.div_euclid(12))
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, months.rem_euclid(12) as u32 + 1, 1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| runtime_error("date table out of range"))?;

    let offset = [
        day.checked_sub(1).and_then(ChronoDuration::try_days),
        ChronoDuration::try_hours(hour),
        ChronoDuration::try_minutes(min),
        ChronoDuration::try_seconds(sec),
    ]
    .into_iter()
    .try_fold(ChronoDuration::zero(), |acc, part| acc.checked_add(&part?))
    .ok_or_else(|| runtime_error("date table out of range"))?;

    first
        .checked_add_signed(offset)
        .ok_or_else(|| runtime_error("date table out of range"))
}

fn time(table: Option<Table>) -> mlua::Result<i64> {
    let Some(table) = table else {
        return Ok(Utc::now().timestamp());
    };
    let naive = from_table(&table)?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| runtime_error("date table names a skipped local time"))?;
    Ok(local.timestamp())
}

fn to_table<'lua, Tz: TimeZone>(lua: &'lua Lua, at: &DateTime<Tz>) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    table.set("year", at.year())?;
    table.set("month", at.month())?;
    table.set("day", at.day())?;
    table.set("hour", at.hour())?;
    table.set("min", at.minute())?;
    table.set("sec", at.second())?;
    table.set("wday", at.weekday().number_from_sunday())?;
    table.set("yday", at.ordinal())?;
    table.set("isdst", false)?;
    Ok(table)
}

fn render<'lua, Tz>(lua: &'lua Lua, format: &str, at: DateTime<Tz>) -> mlua::Result<Value<'lua>>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if format == "*t" {
        return to_table(lua, &at).map(Value::Table);
    }
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(runtime_error(format!("date: invalid conversion in '{format}'")));
    }
    let text = at.format_with_items(items.iter()).to_string();
    lua.create_string(&text).map(Value::String)
}

fn date<'lua>(lua: &'lua Lua, format: &str, at: Option<i64>) -> mlua::Result<Value<'lua>> {
    let utc = match at {
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| runtime_error(format!("date: time {secs} out of range")))?,
        None => Utc::now(),
    };
    match format.strip_prefix('!') {
        Some(format) => render(lua, format, utc),
        None => render(lua, format, utc.with_timezone(&Local)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua() -> Lua {
        let lua = Lua::new();
        register(&lua, Instant::now()).unwrap();
        lua
    }

    #[test]
    fn test_date_utc_format() {
        let lua = lua();
        let text: String = lua.load(r#"return date("!%Y-%m-%d %H:%M:%S", 86400)"#).eval().unwrap();
        assert_eq!(text, "1970-01-02 00:00:00");
    }

    #[test]
    fn test_date_table() {
        let lua = lua();
        let (year, month, day, wday, yday): (i64, i64, i64, i64, i64) = lua
            .load(r#"local t = date("!*t", 0) return t.year, t.month, t.day, t.wday, t.yday"#)
            .eval()
            .unwrap();
        // 1970-01-01 was a Thursday
        assert_eq!((year, month, day, wday, yday), (1970, 1, 1, 5, 1));
    }

    #[test]
    fn test_time_round_trips_local_table() {
        let lua = lua();
        let same: bool = lua
            .load(
                r#"
local now = time()
local t = date("*t", now)
return time(t) == now
"#,
            )
            .eval()
            .unwrap();
        assert!(same);
    }

    #[test]
    fn test_time_normalises_fields() {
        let lua = lua();
        let same: bool = lua
            .load(
                r#"
local a = time({year = 2024, month = 1, day = 31, hour = 12})
local b = time({year = 2023, month = 13, day = 31})
return a == b
"#,
            )
            .eval()
            .unwrap();
        assert!(same);
    }

    #[test]
    fn test_time_requires_date_fields() {
        let lua = lua();
        assert!(lua.load("return time({year = 2024})").exec().is_err());
    }

    #[test]
    fn test_time_rejects_extreme_fields() {
        let lua = lua();
        for table in [
            "{year = 2024, month = math.mininteger, day = 1}",
            "{year = math.maxinteger, month = 1, day = 1}",
            "{year = 2024, month = 1, day = math.mininteger}",
        ] {
            assert!(lua.load(format!("return time({table})")).exec().is_err(), "{table}");
        }
    }

    #[test]
    fn test_difftime_and_clock() {
        let lua = lua();
        let diff: f64 = lua.load("return difftime(10, 4)").eval().unwrap();
        assert_eq!(diff, 6.0);
        let clock: f64 = lua.load("return clock()").eval().unwrap();
        assert!(clock >= 0.0);
    }

    #[test]
    fn test_invalid_format_is_an_error() {
        let lua = lua();
        assert!(lua.load(r#"return date("%Q")"#).exec().is_err());
    }
}
