//! Query builder for stored readings.
//!
//! # Example
//!
//! ```
//! use coldchain_store::{ReadingQuery, Store};
//! use coldchain_types::SensorKind;
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let hour_ago = OffsetDateTime::now_utc() - Duration::hours(1);
//!
//! let query = ReadingQuery::new()
//!     .unit("5")
//!     .kind(SensorKind::Temperature)
//!     .since(hour_ago)
//!     .limit(50);
//!
//! let readings = store.query_readings(&query)?;
//! # Ok::<(), coldchain_store::Error>(())
//! ```

use time::OffsetDateTime;

use coldchain_types::SensorKind;

use crate::store::to_millis;

/// Fluent query builder for readings.
///
/// By default, queries return results ordered by `timestamp` descending
/// (newest first) with no limit.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadingQuery {
    /// Filter by storage unit.
    pub unit_id: Option<String>,
    /// Filter by sensor kind.
    pub kind: Option<SensorKind>,
    /// Include only readings at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Include only readings at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by timestamp descending (newest first).
    pub newest_first: bool,
}

impl ReadingQuery {
    /// Create a new query: all units, all kinds, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    pub fn unit(mut self, unit_id: &str) -> Self {
        self.unit_id = Some(unit_id.to_string());
        self
    }

    pub fn kind(mut self, kind: SensorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results. Use with `limit()` for pagination.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results chronologically.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref unit_id) = self.unit_id {
            conditions.push("unit_id = ?");
            params.push(Box::new(unit_id.clone()));
        }

        if let Some(kind) = self.kind {
            conditions.push("sensor_kind = ?");
            params.push(Box::new(kind.to_string()));
        }

        if let Some(since) = self.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(to_millis(since)));
        }

        if let Some(until) = self.until {
            conditions.push("timestamp <= ?");
            params.push(Box::new(to_millis(until)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, unit_id, sensor_kind, value, timestamp \
             FROM readings {} ORDER BY timestamp {}, id {}",
            where_clause, order, order
        );

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            // SQLite requires a LIMIT before OFFSET
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}
