//! Aggregation buffer: accumulates readings until a flush policy is met.
//!
//! A flush is a two-step hand-off. [`AggregationBuffer::begin_flush`] takes
//! the whole accumulated batch out of the buffer and marks a flush as in
//! flight, so no second flush can start while the first is being synced.
//! [`AggregationBuffer::finish_flush`] ends the flush and either drops the
//! batch or puts it back in front of readings that arrived meanwhile.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use coldchain_types::{AggregateBounds, Reading, SensorKind};

use crate::error::{Error, Result};

/// Default cap on buffered readings.
pub const DEFAULT_MAX_READINGS: usize = 10_000;

/// Condition under which the buffer becomes eligible for a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every kind in `expected` has at least `min_samples` buffered readings.
    PerKind {
        expected: BTreeSet<SensorKind>,
        min_samples: usize,
    },
    /// The buffer holds at least `size` readings of any kinds.
    BufferSize { size: usize },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::per_kind([SensorKind::Temperature, SensorKind::Humidity], 10)
    }
}

impl FlushPolicy {
    /// Flush once every listed kind has `min_samples` readings.
    pub fn per_kind(kinds: impl IntoIterator<Item = SensorKind>, min_samples: usize) -> Self {
        Self::PerKind {
            expected: kinds.into_iter().collect(),
            min_samples,
        }
    }

    /// Flush once `size` readings are buffered.
    pub fn buffer_size(size: usize) -> Self {
        Self::BufferSize { size }
    }

    fn is_satisfied(&self, counts: &BTreeMap<SensorKind, usize>, len: usize) -> bool {
        match self {
            FlushPolicy::PerKind {
                expected,
                min_samples,
            } => expected
                .iter()
                .all(|kind| counts.get(kind).copied().unwrap_or(0) >= *min_samples),
            FlushPolicy::BufferSize { size } => len >= *size,
        }
    }
}

/// What to do with a flushed batch whose sync exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Drop the batch.
    #[default]
    Discard,
    /// Put the batch back so it is included in the next flush.
    Retain,
}

/// Snapshot of buffer occupancy, published for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Readings currently buffered (excludes a batch in flight).
    pub buffered: usize,
    /// Buffered readings per sensor kind.
    pub counts: BTreeMap<String, usize>,
    /// Whether a flush is being synced.
    pub flush_in_flight: bool,
    /// Readings dropped because the buffer hit its cap.
    pub evicted: u64,
}

/// Ordered collection of readings awaiting aggregation.
///
/// Invariant: `counts()` always equals the per-kind tally of the buffered
/// readings.
#[derive(Debug)]
pub struct AggregationBuffer {
    policy: FlushPolicy,
    max_readings: usize,
    readings: VecDeque<Reading>,
    counts: BTreeMap<SensorKind, usize>,
    flush_in_flight: bool,
    evicted: u64,
}

impl AggregationBuffer {
    /// Create an empty buffer with the default cap.
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            max_readings: DEFAULT_MAX_READINGS,
            readings: VecDeque::new(),
            counts: BTreeMap::new(),
            flush_in_flight: false,
            evicted: 0,
        }
    }

    /// Set the maximum number of buffered readings (at least 1).
    #[must_use]
    pub fn with_max_readings(mut self, max_readings: usize) -> Self {
        self.max_readings = max_readings.max(1);
        self
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    /// Append a reading. Returns whether the buffer is now flush-eligible.
    ///
    /// When the cap is exceeded the oldest readings are evicted.
    pub fn ingest(&mut self, reading: Reading) -> bool {
        *self.counts.entry(reading.sensor_kind).or_insert(0) += 1;
        self.readings.push_back(reading);
        self.enforce_cap();
        self.is_flush_eligible()
    }

    /// Whether a flush may start now.
    pub fn is_flush_eligible(&self) -> bool {
        !self.flush_in_flight
            && !self.readings.is_empty()
            && self.policy.is_satisfied(&self.counts, self.readings.len())
    }

    /// Take the buffered readings for a flush, if eligible.
    ///
    /// Returns `None` when the policy is not met or a flush is already in
    /// flight. On success the buffer is empty and the flush is in flight.
    pub fn begin_flush(&mut self) -> Option<Vec<Reading>> {
        if !self.is_flush_eligible() {
            return None;
        }
        self.flush_in_flight = true;
        self.counts.clear();
        Some(self.readings.drain(..).collect())
    }

    /// End the in-flight flush.
    ///
    /// With `retain` the batch goes back in front of any readings that
    /// arrived during the flush; otherwise it is dropped. Returns the number
    /// of readings put back.
    pub fn finish_flush(&mut self, batch: Vec<Reading>, retain: bool) -> usize {
        self.flush_in_flight = false;
        if !retain {
            return 0;
        }

        let restored = batch.len();
        let newer = std::mem::take(&mut self.readings);
        self.readings = batch.into();
        self.readings.extend(newer);
        self.recount();
        self.enforce_cap();
        restored
    }

    pub fn flush_in_flight(&self) -> bool {
        self.flush_in_flight
    }

    /// Per-kind counts of buffered readings.
    pub fn counts(&self) -> &BTreeMap<SensorKind, usize> {
        &self.counts
    }

    /// Buffered readings of one kind.
    pub fn count(&self, kind: SensorKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Iterate buffered readings oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.readings.len(),
            counts: self
                .counts
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            flush_in_flight: self.flush_in_flight,
            evicted: self.evicted,
        }
    }

    fn recount(&mut self) {
        self.counts.clear();
        for reading in &self.readings {
            *self.counts.entry(reading.sensor_kind).or_insert(0) += 1;
        }
    }

    fn enforce_cap(&mut self) {
        let mut dropped = 0usize;
        while self.readings.len() > self.max_readings {
            let Some(oldest) = self.readings.pop_front() else {
                break;
            };
            if let Some(count) = self.counts.get_mut(&oldest.sensor_kind) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&oldest.sensor_kind);
                }
            }
            dropped += 1;
        }
        if dropped > 0 {
            self.evicted += dropped as u64;
            warn!(
                "Aggregation buffer full ({} readings), evicted {} oldest",
                self.max_readings, dropped
            );
        }
    }
}

/// Compute min/max temperature and humidity over a flushed set, widened by `margin`.
///
/// Readings of other kinds are ignored. Fails with
/// [`Error::EmptyPopulation`] when either bounded kind is absent.
///
/// # Examples
///
/// ```
/// use coldchain_core::compute_bounds;
/// use coldchain_types::{Reading, SensorKind};
/// use time::OffsetDateTime;
///
/// let now = OffsetDateTime::now_utc();
/// let readings = vec![
///     Reading::new("1", SensorKind::Temperature, 2.0, now),
///     Reading::new("1", SensorKind::Temperature, 6.0, now),
///     Reading::new("1", SensorKind::Humidity, 40.0, now),
///     Reading::new("1", SensorKind::Humidity, 55.0, now),
/// ];
///
/// let bounds = compute_bounds(&readings, 0.0).unwrap();
/// assert_eq!((bounds.min_temp, bounds.max_temp), (2.0, 6.0));
/// assert_eq!((bounds.min_humidity, bounds.max_humidity), (40.0, 55.0));
/// ```
pub fn compute_bounds(readings: &[Reading], margin: f64) -> Result<AggregateBounds> {
    let (min_temp, max_temp) = min_max(readings, SensorKind::Temperature)
        .ok_or(Error::EmptyPopulation(SensorKind::Temperature))?;
    let (min_humidity, max_humidity) = min_max(readings, SensorKind::Humidity)
        .ok_or(Error::EmptyPopulation(SensorKind::Humidity))?;

    Ok(AggregateBounds {
        min_temp,
        max_temp,
        min_humidity,
        max_humidity,
    }
    .with_margin(margin))
}

fn min_max(readings: &[Reading], kind: SensorKind) -> Option<(f64, f64)> {
    readings
        .iter()
        .filter(|r| r.sensor_kind == kind)
        .map(|r| r.value)
        .fold(None, |acc, value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::OffsetDateTime;
    use time::macros::datetime;

    const AT: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

    fn reading(kind: SensorKind, value: f64) -> Reading {
        Reading::new("1", kind, value, AT)
    }

    fn fill(buffer: &mut AggregationBuffer, kind: SensorKind, n: usize) -> bool {
        let mut eligible = false;
        for i in 0..n {
            eligible = buffer.ingest(reading(kind, i as f64));
        }
        eligible
    }

    #[test]
    fn test_per_kind_waits_for_every_kind() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::default());
        assert!(!fill(&mut buffer, SensorKind::Temperature, 25));
        assert!(!fill(&mut buffer, SensorKind::Humidity, 9));
        assert!(buffer.begin_flush().is_none());
        assert!(fill(&mut buffer, SensorKind::Humidity, 1));
    }

    #[test]
    fn test_per_kind_ignores_unexpected_kinds() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::default());
        fill(&mut buffer, SensorKind::Proximity(1), 50);
        assert!(!buffer.is_flush_eligible());
        assert_eq!(buffer.count(SensorKind::Proximity(1)), 50);
    }

    #[test]
    fn test_buffer_size_policy() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::buffer_size(20));
        assert!(!fill(&mut buffer, SensorKind::Proximity(0), 19));
        assert!(buffer.ingest(reading(SensorKind::Temperature, 1.0)));
    }

    #[test]
    fn test_begin_flush_empties_and_blocks_second_flush() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::buffer_size(2));
        fill(&mut buffer, SensorKind::Temperature, 2);

        let batch = buffer.begin_flush().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.counts().is_empty());
        assert!(buffer.flush_in_flight());

        fill(&mut buffer, SensorKind::Temperature, 3);
        assert!(!buffer.is_flush_eligible());
        assert!(buffer.begin_flush().is_none());

        assert_eq!(buffer.finish_flush(batch, false), 0);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_flush_eligible());
    }

    #[test]
    fn test_finish_flush_retain_prepends_batch() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::buffer_size(2));
        buffer.ingest(reading(SensorKind::Temperature, 1.0));
        buffer.ingest(reading(SensorKind::Humidity, 2.0));
        let batch = buffer.begin_flush().unwrap();

        buffer.ingest(reading(SensorKind::Temperature, 3.0));
        assert_eq!(buffer.finish_flush(batch, true), 2);

        let values: Vec<f64> = buffer.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.count(SensorKind::Temperature), 2);
        assert_eq!(buffer.count(SensorKind::Humidity), 1);
        assert!(!buffer.flush_in_flight());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::default()).with_max_readings(3);
        buffer.ingest(reading(SensorKind::Humidity, 1.0));
        buffer.ingest(reading(SensorKind::Temperature, 2.0));
        buffer.ingest(reading(SensorKind::Temperature, 3.0));
        buffer.ingest(reading(SensorKind::Temperature, 4.0));

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.count(SensorKind::Humidity), 0);
        assert_eq!(buffer.count(SensorKind::Temperature), 3);
        assert_eq!(buffer.stats().evicted, 1);
        assert!(!buffer.counts().contains_key(&SensorKind::Humidity));
    }

    #[test]
    fn test_stats() {
        let mut buffer = AggregationBuffer::new(FlushPolicy::default());
        buffer.ingest(reading(SensorKind::Temperature, 1.0));
        buffer.ingest(reading(SensorKind::Proximity(2), 0.0));

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.counts.get("temperature"), Some(&1));
        assert_eq!(stats.counts.get("proximity2"), Some(&1));
        assert!(!stats.flush_in_flight);
    }

    #[test]
    fn test_compute_bounds_ignores_other_kinds() {
        let readings = vec![
            reading(SensorKind::Temperature, 4.0),
            reading(SensorKind::Proximity(1), 999.0),
            reading(SensorKind::Temperature, -1.5),
            reading(SensorKind::Humidity, 50.0),
        ];
        let bounds = compute_bounds(&readings, 0.0).unwrap();
        assert_eq!(bounds.min_temp, -1.5);
        assert_eq!(bounds.max_temp, 4.0);
        assert_eq!(bounds.min_humidity, 50.0);
        assert_eq!(bounds.max_humidity, 50.0);
    }

    #[test]
    fn test_compute_bounds_margin() {
        let readings = vec![
            reading(SensorKind::Temperature, 4.0),
            reading(SensorKind::Humidity, 50.0),
        ];
        let bounds = compute_bounds(&readings, 0.5).unwrap();
        assert_eq!(bounds.min_temp, 3.5);
        assert_eq!(bounds.max_temp, 4.5);
        assert_eq!(bounds.min_humidity, 49.5);
        assert_eq!(bounds.max_humidity, 50.5);
    }

    #[test]
    fn test_compute_bounds_empty_population() {
        let readings = vec![reading(SensorKind::Temperature, 4.0)];
        assert!(matches!(
            compute_bounds(&readings, 0.0),
            Err(Error::EmptyPopulation(SensorKind::Humidity))
        ));
        assert!(matches!(
            compute_bounds(&[], 0.0),
            Err(Error::EmptyPopulation(SensorKind::Temperature))
        ));
    }

    fn kind_strategy() -> impl Strategy<Value = SensorKind> {
        prop_oneof![
            Just(SensorKind::Temperature),
            Just(SensorKind::Humidity),
            (0u8..4).prop_map(SensorKind::Proximity),
        ]
    }

    proptest! {
        #[test]
        fn counts_match_buffer_contents(
            kinds in proptest::collection::vec(kind_strategy(), 0..200),
            cap in 1usize..64,
        ) {
            let mut buffer = AggregationBuffer::new(FlushPolicy::default()).with_max_readings(cap);
            for kind in kinds {
                buffer.ingest(reading(kind, 0.0));
                let mut tally: BTreeMap<SensorKind, usize> = BTreeMap::new();
                for r in buffer.iter() {
                    *tally.entry(r.sensor_kind).or_insert(0) += 1;
                }
                prop_assert_eq!(&tally, buffer.counts());
                prop_assert!(buffer.len() <= cap);
            }
        }

        #[test]
        fn per_kind_flush_requires_every_kind(
            kinds in proptest::collection::vec(kind_strategy(), 0..100),
        ) {
            let mut buffer = AggregationBuffer::new(FlushPolicy::default());
            for kind in kinds {
                let eligible = buffer.ingest(reading(kind, 0.0));
                let expected = buffer.count(SensorKind::Temperature) >= 10
                    && buffer.count(SensorKind::Humidity) >= 10;
                prop_assert_eq!(eligible, expected);
                if eligible {
                    let batch = buffer.begin_flush().unwrap();
                    buffer.finish_flush(batch, false);
                }
            }
        }

        #[test]
        fn bounds_enclose_every_bounded_reading(
            temps in proptest::collection::vec(-40.0f64..40.0, 1..30),
            hums in proptest::collection::vec(0.0f64..100.0, 1..30),
            margin in 0.0f64..5.0,
        ) {
            let readings: Vec<Reading> = temps
                .iter()
                .map(|v| reading(SensorKind::Temperature, *v))
                .chain(hums.iter().map(|v| reading(SensorKind::Humidity, *v)))
                .collect();
            let bounds = compute_bounds(&readings, margin).unwrap();
            for t in &temps {
                prop_assert!(bounds.min_temp <= *t && *t <= bounds.max_temp);
            }
            for h in &hums {
                prop_assert!(bounds.min_humidity <= *h && *h <= bounds.max_humidity);
            }
        }
    }
}
