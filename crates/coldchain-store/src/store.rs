//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use coldchain_types::{Reading, SensorKind};

use crate::error::{Error, Result};
use crate::models::{StoredReading, StoredUnit};
use crate::queries::ReadingQuery;
use crate::schema;

pub(crate) fn to_millis(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| Error::InvalidTimestamp(format!("{}: {}", millis, e)))
}

fn conversion_error(
    column: usize,
    kind: Type,
    cause: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, kind, Box::new(cause))
}

fn row_to_reading(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    let sensor_kind = row
        .get::<_, String>(2)?
        .parse::<SensorKind>()
        .map_err(|e| conversion_error(2, Type::Text, e))?;
    let timestamp = from_millis(row.get(4)?).map_err(|e| conversion_error(4, Type::Integer, e))?;

    Ok(StoredReading {
        id: row.get(0)?,
        unit_id: row.get(1)?,
        sensor_kind,
        value: row.get(3)?,
        timestamp,
    })
}

/// SQLite-based store for sensor readings.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening reading store at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    fn touch_unit(&self, unit_id: &str, now: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO units (id, first_seen, last_seen) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET last_seen = ?2",
            rusqlite::params![unit_id, now],
        )?;
        Ok(())
    }

    /// Store one reading. Returns its row ID.
    pub fn insert_reading(&self, reading: &Reading) -> Result<i64> {
        let now = to_millis(OffsetDateTime::now_utc());
        self.touch_unit(&reading.unit_id, now)?;

        self.conn.execute(
            "INSERT INTO readings (unit_id, sensor_kind, value, timestamp, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                reading.unit_id,
                reading.sensor_kind.to_string(),
                reading.value,
                to_millis(reading.timestamp),
                now,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Store a batch of readings in one transaction.
    pub fn insert_readings(&mut self, readings: &[Reading]) -> Result<usize> {
        let now = to_millis(OffsetDateTime::now_utc());
        let tx = self.conn.transaction()?;
        {
            let mut unit_stmt = tx.prepare_cached(
                "INSERT INTO units (id, first_seen, last_seen) VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_seen = ?2",
            )?;
            let mut reading_stmt = tx.prepare_cached(
                "INSERT INTO readings (unit_id, sensor_kind, value, timestamp, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for reading in readings {
                unit_stmt.execute(rusqlite::params![reading.unit_id, now])?;
                reading_stmt.execute(rusqlite::params![
                    reading.unit_id,
                    reading.sensor_kind.to_string(),
                    reading.value,
                    to_millis(reading.timestamp),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} readings", readings.len());
        Ok(readings.len())
    }

    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<StoredReading>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let readings = stmt
            .query_map(params_ref.as_slice(), row_to_reading)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Latest reading for a unit, optionally of a single kind.
    pub fn latest_reading(
        &self,
        unit_id: &str,
        kind: Option<SensorKind>,
    ) -> Result<Option<StoredReading>> {
        let mut query = ReadingQuery::new().unit(unit_id).limit(1);
        if let Some(kind) = kind {
            query = query.kind(kind);
        }
        Ok(self.query_readings(&query)?.into_iter().next())
    }

    /// Count readings, optionally for a single unit.
    pub fn count_readings(&self, unit_id: Option<&str>) -> Result<u64> {
        let count: i64 = match unit_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE unit_id = ?",
                [id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }

    /// Look up one unit.
    pub fn get_unit(&self, unit_id: &str) -> Result<Option<StoredUnit>> {
        let row = self
            .conn
            .query_row(
                "SELECT u.id, u.first_seen, u.last_seen,
                        (SELECT COUNT(*) FROM readings r WHERE r.unit_id = u.id)
                 FROM units u WHERE u.id = ?",
                [unit_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, first, last, count)| {
            Ok(StoredUnit {
                id,
                first_seen: from_millis(first)?,
                last_seen: from_millis(last)?,
                reading_count: count as u64,
            })
        })
        .transpose()
    }

    /// All units that have reported, most recently seen first.
    pub fn list_units(&self) -> Result<Vec<StoredUnit>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.first_seen, u.last_seen,
                    (SELECT COUNT(*) FROM readings r WHERE r.unit_id = u.id)
             FROM units u ORDER BY u.last_seen DESC, u.id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, first, last, count)| {
                Ok(StoredUnit {
                    id,
                    first_seen: from_millis(first)?,
                    last_seen: from_millis(last)?,
                    reading_count: count as u64,
                })
            })
            .collect()
    }

    /// Delete readings with a timestamp before `cutoff`. Returns rows removed.
    pub fn prune_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM readings WHERE timestamp < ?",
            [to_millis(cutoff)],
        )?;
        if removed > 0 {
            info!("Pruned {} readings older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use time::macros::datetime;

    fn reading(unit: &str, kind: SensorKind, value: f64, at: OffsetDateTime) -> Reading {
        Reading::new(unit, kind, value, at)
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.count_readings(None).unwrap(), 0);
        assert!(store.list_units().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_query_reading() {
        let store = Store::open_in_memory().unwrap();
        let at = datetime!(2024-05-01 10:00:00.125 UTC);
        let id = store
            .insert_reading(&reading("5", SensorKind::Temperature, 4.25, at))
            .unwrap();
        assert!(id > 0);

        let stored = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].unit_id, "5");
        assert_eq!(stored[0].sensor_kind, SensorKind::Temperature);
        assert_eq!(stored[0].value, 4.25);
        assert_eq!(stored[0].timestamp, at);
        assert_eq!(stored[0].to_reading().topic(), "warehouse/unit/5/sensor/temperature");
    }

    #[test]
    fn test_query_filters() {
        let mut store = Store::open_in_memory().unwrap();
        let base = datetime!(2024-05-01 10:00 UTC);
        store
            .insert_readings(&[
                reading("5", SensorKind::Temperature, 1.0, base),
                reading("5", SensorKind::Humidity, 50.0, base + Duration::minutes(1)),
                reading("6", SensorKind::Temperature, 2.0, base + Duration::minutes(2)),
                reading("5", SensorKind::Temperature, 3.0, base + Duration::minutes(3)),
                reading("5", SensorKind::Proximity(1), 1.0, base + Duration::minutes(4)),
            ])
            .unwrap();

        let temps = store
            .query_readings(&ReadingQuery::new().unit("5").kind(SensorKind::Temperature))
            .unwrap();
        let values: Vec<f64> = temps.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![3.0, 1.0]);

        let window = store
            .query_readings(
                &ReadingQuery::new()
                    .since(base + Duration::minutes(1))
                    .until(base + Duration::minutes(3))
                    .oldest_first(),
            )
            .unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].value, 50.0);

        let limited = store.query_readings(&ReadingQuery::new().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].sensor_kind, SensorKind::Proximity(1));
    }

    #[test]
    fn test_latest_reading() {
        let store = Store::open_in_memory().unwrap();
        let base = datetime!(2024-05-01 10:00 UTC);
        store
            .insert_reading(&reading("5", SensorKind::Humidity, 40.0, base))
            .unwrap();
        store
            .insert_reading(&reading("5", SensorKind::Humidity, 45.0, base + Duration::minutes(1)))
            .unwrap();

        store
            .insert_reading(&reading("5", SensorKind::Proximity(1), 1.0, base - Duration::minutes(1)))
            .unwrap();

        let latest = store.latest_reading("5", Some(SensorKind::Humidity)).unwrap().unwrap();
        assert_eq!(latest.value, 45.0);
        let latest = store.latest_reading("5", None).unwrap().unwrap();
        assert_eq!(latest.sensor_kind, SensorKind::Humidity);
        assert!(store.latest_reading("5", Some(SensorKind::Temperature)).unwrap().is_none());
        assert!(store.latest_reading("6", None).unwrap().is_none());
    }

    #[test]
    fn test_units_tracked() {
        let store = Store::open_in_memory().unwrap();
        let at = datetime!(2024-05-01 10:00 UTC);
        store
            .insert_reading(&reading("5", SensorKind::Temperature, 1.0, at))
            .unwrap();
        store
            .insert_reading(&reading("5", SensorKind::Humidity, 2.0, at))
            .unwrap();
        store
            .insert_reading(&reading("9", SensorKind::Temperature, 3.0, at))
            .unwrap();

        let units = store.list_units().unwrap();
        assert_eq!(units.len(), 2);
        let unit = store.get_unit("5").unwrap().unwrap();
        assert_eq!(unit.reading_count, 2);
        assert!(unit.first_seen <= unit.last_seen);
        assert!(store.get_unit("missing").unwrap().is_none());
        assert_eq!(store.count_readings(Some("9")).unwrap(), 1);
    }

    #[test]
    fn test_prune_before() {
        let store = Store::open_in_memory().unwrap();
        let base = datetime!(2024-05-01 10:00 UTC);
        for i in 0..5 {
            store
                .insert_reading(&reading(
                    "5",
                    SensorKind::Temperature,
                    i as f64,
                    base + Duration::days(i),
                ))
                .unwrap();
        }

        let removed = store.prune_before(base + Duration::days(2)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_readings(None).unwrap(), 3);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("readings.db");
        let store = Store::open(&path).unwrap();
        store
            .insert_reading(&reading(
                "1",
                SensorKind::Humidity,
                55.0,
                OffsetDateTime::now_utc(),
            ))
            .unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.count_readings(None).unwrap(), 1);
    }

    #[test]
    fn test_stored_reading_json_shape() {
        let stored = StoredReading {
            id: 1,
            unit_id: "5".into(),
            sensor_kind: SensorKind::Proximity(2),
            value: 1.0,
            timestamp: datetime!(2024-05-01 10:00 UTC),
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["unitId"], "5");
        assert_eq!(json["sensorKind"], "proximity2");
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00Z");
    }
}
