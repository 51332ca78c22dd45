use crate::error::AppError;
use crate::models::{HalfHourReading, JST};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub struct Storage {
    conn: Connection,
}

/// Row shape used by `export`.
#[derive(Debug, Clone, Serialize)]
pub struct StoredReading {
    pub start_at: String,
    pub end_at: String,
    pub consumption_kwh: f64,
    pub version: Option<String>,
}

fn db_timestamp(at: &DateTime<chrono_tz::Tz>) -> String {
    at.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS half_hour_readings (
                start_at TEXT PRIMARY KEY,
                end_at TEXT NOT NULL,
                consumption_kwh REAL NOT NULL,
                version TEXT
            );

            CREATE TABLE IF NOT EXISTS energy_meter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cumulative_kwh REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counted_intervals (
                start_at TEXT PRIMARY KEY
            );
            "#,
        )?;
        Ok(())
    }

    /// Stores one cycle's readings and advances the meter in one transaction.
    ///
    /// Returns the running total after the cycle.
    pub fn record_cycle(&mut self, readings: &[HalfHourReading]) -> Result<f64, AppError> {
        let tx = self.conn.transaction()?;
        upsert_readings(&tx, readings)?;
        let total = advance_meter(&tx, readings)?;
        tx.commit()?;
        Ok(total)
    }

    pub fn cumulative_kwh(&self) -> Result<f64, AppError> {
        meter_total(&self.conn)
    }

    pub fn readings(&self) -> Result<Vec<HalfHourReading>, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT start_at, end_at, consumption_kwh, version FROM half_hour_readings ORDER BY start_at",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(HalfHourReading {
                    start_at: parse_db_timestamp(&r.get::<_, String>(0)?, 0)?,
                    end_at: parse_db_timestamp(&r.get::<_, String>(1)?, 1)?,
                    consumption_kwh: r.get(2)?,
                    version: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_readings_json(&self) -> Result<String, AppError> {
        let rows: Vec<StoredReading> = self
            .readings()?
            .into_iter()
            .map(|r| StoredReading {
                start_at: r.start_at.to_rfc3339(),
                end_at: r.end_at.to_rfc3339(),
                consumption_kwh: r.consumption_kwh,
                version: r.version,
            })
            .collect();
        Ok(serde_json::to_string_pretty(&rows)?)
    }
}

fn upsert_readings(conn: &Connection, readings: &[HalfHourReading]) -> Result<(), AppError> {
    let mut upsert = conn.prepare(
        "INSERT INTO half_hour_readings (start_at, end_at, consumption_kwh, version)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(start_at) DO UPDATE SET
            end_at = excluded.end_at,
            consumption_kwh = excluded.consumption_kwh,
            version = excluded.version",
    )?;
    for r in readings {
        upsert.execute(params![
            db_timestamp(&r.start_at),
            db_timestamp(&r.end_at),
            r.consumption_kwh,
            r.version,
        ])?;
    }
    Ok(())
}

fn meter_total(conn: &Connection) -> Result<f64, AppError> {
    Ok(conn
        .query_row(
            "SELECT cumulative_kwh FROM energy_meter WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0.0))
}

/// Adds every interval not counted before, wherever it falls in time.
///
/// Revisions of an interval that was already counted are ignored, so the
/// total never moves backwards.
fn advance_meter(conn: &Connection, readings: &[HalfHourReading]) -> Result<f64, AppError> {
    let mut total = meter_total(conn)?;
    {
        let mut mark = conn.prepare("INSERT OR IGNORE INTO counted_intervals (start_at) VALUES (?)")?;
        for r in readings {
            if mark.execute(params![db_timestamp(&r.start_at)])? == 1 {
                total += r.consumption_kwh.max(0.0);
            }
        }
    }
    conn.execute(
        "INSERT INTO energy_meter (id, cumulative_kwh) VALUES (1, ?)
         ON CONFLICT(id) DO UPDATE SET cumulative_kwh = excluded.cumulative_kwh",
        params![total],
    )?;
    Ok(total)
}

fn parse_db_timestamp(raw: &str, col: usize) -> rusqlite::Result<DateTime<chrono_tz::Tz>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&JST))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn jst(d: u32, h: u32, min: u32) -> DateTime<chrono_tz::Tz> {
        JST.with_ymd_and_hms(2024, 5, d, h, min, 0).unwrap()
    }

    fn open_temp() -> (TempDir, Storage) {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("readings.sqlite");
        let storage = Storage::open(&db).expect("open storage");
        (tmp, storage)
    }

    fn total(storage: &mut Storage, readings: &[HalfHourReading]) -> f64 {
        storage.record_cycle(readings).expect("record cycle")
    }

    #[test]
    fn record_cycle_upserts_by_interval() {
        let (_tmp, mut storage) = open_temp();
        total(
            &mut storage,
            &[
                HalfHourReading::new(jst(2, 0, 30), 0.3),
                HalfHourReading::new(jst(2, 0, 0), 0.5),
            ],
        );

        let mut revised = HalfHourReading::new(jst(2, 0, 30), 0.35);
        revised.version = Some("2".into());
        total(&mut storage, &[revised]);

        let rows = storage.readings().expect("read back");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_at, jst(2, 0, 0));
        assert_eq!(rows[1].consumption_kwh, 0.35);
        assert_eq!(rows[1].version.as_deref(), Some("2"));
    }

    #[test]
    fn meter_counts_each_interval_once() {
        let (_tmp, mut storage) = open_temp();
        let first = vec![
            HalfHourReading::new(jst(2, 0, 0), 0.5),
            HalfHourReading::new(jst(2, 0, 30), 0.3),
        ];
        assert!((total(&mut storage, &first) - 0.8).abs() < 1e-9);

        // Same window fetched again plus one new interval and a downward revision.
        let second = vec![
            HalfHourReading::new(jst(2, 0, 0), 0.1),
            HalfHourReading::new(jst(2, 0, 30), 0.3),
            HalfHourReading::new(jst(2, 1, 0), 0.2),
        ];
        assert!((total(&mut storage, &second) - 1.0).abs() < 1e-9);
        assert!((storage.cumulative_kwh().expect("read") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn meter_counts_intervals_published_late() {
        let (_tmp, mut storage) = open_temp();
        let first = vec![
            HalfHourReading::new(jst(2, 0, 0), 0.5),
            HalfHourReading::new(jst(2, 1, 0), 0.2),
        ];
        assert!((total(&mut storage, &first) - 0.7).abs() < 1e-9);

        let second = vec![
            HalfHourReading::new(jst(2, 0, 0), 0.5),
            HalfHourReading::new(jst(2, 0, 30), 0.4),
            HalfHourReading::new(jst(2, 1, 0), 0.2),
        ];
        assert!((total(&mut storage, &second) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn meter_never_decreases() {
        let (_tmp, mut storage) = open_temp();
        let mut previous = 0.0;
        for (hour, kwh) in [(0, 0.4), (1, 0.0), (2, 1.2), (2, 0.0), (3, 0.7)] {
            let t = total(&mut storage, &[HalfHourReading::new(jst(3, hour, 0), kwh)]);
            assert!(t >= previous);
            previous = t;
        }
        assert!(total(&mut storage, &[]) >= previous);
    }

    #[test]
    fn meter_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("readings.sqlite");
        {
            let mut storage = Storage::open(&db).expect("open");
            total(&mut storage, &[HalfHourReading::new(jst(2, 0, 0), 1.5)]);
        }
        let mut storage = Storage::open(&db).expect("reopen");
        assert!((storage.cumulative_kwh().expect("read") - 1.5).abs() < 1e-9);
        // Already counted before the restart.
        assert!((total(&mut storage, &[HalfHourReading::new(jst(2, 0, 0), 1.5)]) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn export_readings_json_serializes_rows_in_tokyo_time() {
        let (_tmp, mut storage) = open_temp();
        total(&mut storage, &[HalfHourReading::new(jst(2, 0, 0), 0.5)]);

        let json = storage.export_readings_json().expect("export");
        let rows: serde_json::Value = serde_json::from_str(&json).expect("parse export");
        let arr = rows.as_array().expect("array");
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["start_at"], "2024-05-02T00:00:00+09:00");
        assert_eq!(arr[0]["consumption_kwh"], 0.5);
    }
}
