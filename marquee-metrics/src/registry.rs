//! Thread-safe metrics registry shared by request handlers and the exporter.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use marquee_common::current_timestamp_millis;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::naming::{sanitize_label_name, sanitize_metric_name};
use crate::snapshot::{HistogramSnapshot, MetricSnapshot, SampleValue, SeriesKey, SeriesSnapshot};

/// Default histogram buckets, matching the Prometheus client defaults.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default cap on the number of distinct series.
pub const DEFAULT_MAX_SERIES: usize = 10_000;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Metric '{name}' is already registered as a {existing}, not a {requested}")]
    TypeConflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
    #[error("Series limit of {limit} reached, refusing to register '{name}'")]
    SeriesLimit { name: String, limit: usize },
    #[error("Metric '{name}' has label '{label}' more than once")]
    DuplicateLabel { name: String, label: String },
}

/// Monotonically increasing counter handle.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge handle storing an `f64` as raw bits.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` (which may be negative).
    pub fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct HistogramState {
    /// Per-bucket (non-cumulative) counts.
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

#[derive(Debug)]
struct HistogramCore {
    bounds: Vec<f64>,
    state: Mutex<HistogramState>,
}

/// Histogram handle with fixed bucket bounds.
#[derive(Debug, Clone)]
pub struct Histogram(Arc<HistogramCore>);

impl Histogram {
    fn with_bounds(bounds: &[f64]) -> Self {
        let bounds = normalize_bounds(bounds);
        let buckets = vec![0; bounds.len()];
        Self(Arc::new(HistogramCore {
            bounds,
            state: Mutex::new(HistogramState {
                buckets,
                count: 0,
                sum: 0.0,
            }),
        }))
    }

    /// Record one observation. NaN observations are ignored.
    pub fn observe(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let idx = self.0.bounds.partition_point(|b| *b < value);
        let mut state = self.0.state.lock();
        if let Some(bucket) = state.buckets.get_mut(idx) {
            *bucket += 1;
        }
        state.count += 1;
        state.sum += value;
    }

    /// The bucket bounds in use.
    pub fn bounds(&self) -> &[f64] {
        &self.0.bounds
    }

    /// Copy the current state with cumulative bucket counts.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let state = self.0.state.lock();
        let mut running = 0;
        let cumulative_counts = state
            .buckets
            .iter()
            .map(|c| {
                running += c;
                running
            })
            .collect();

        HistogramSnapshot {
            bounds: self.0.bounds.clone(),
            cumulative_counts,
            count: state.count,
            sum: state.sum,
        }
    }
}

/// Sort, deduplicate and drop non-finite bounds.
fn normalize_bounds(bounds: &[f64]) -> Vec<f64> {
    let mut bounds: Vec<f64> = bounds.iter().copied().filter(|b| b.is_finite()).collect();
    bounds.sort_by(f64::total_cmp);
    bounds.dedup();
    bounds
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

impl Metric {
    fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Histogram(_) => "histogram",
        }
    }

    fn sample(&self) -> SampleValue {
        match self {
            Metric::Counter(c) => SampleValue::Counter(c.get()),
            Metric::Gauge(g) => SampleValue::Gauge(g.get()),
            Metric::Histogram(h) => SampleValue::Histogram(h.snapshot()),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Series indexed by key.
    series: HashMap<SeriesKey, Metric>,
    /// Kind registered for each metric name.
    kinds: HashMap<String, &'static str>,
}

/// Process-wide collection of named counters, gauges and histograms.
///
/// Handles returned by [`counter`](Self::counter), [`gauge`](Self::gauge) and
/// [`histogram`](Self::histogram) update lock-free (or under a per-series
/// mutex for histograms); the registry lock is only taken to create a series
/// or to copy the series list for a snapshot.
#[derive(Debug)]
pub struct MetricsRegistry {
    inner: RwLock<RegistryInner>,
    max_series: usize,
}

impl MetricsRegistry {
    /// Create a registry holding at most `max_series` distinct series.
    pub fn new(max_series: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_series,
        }
    }

    /// Get or create a counter.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Result<Counter, RegistryError> {
        match self.get_or_insert(name, labels, "counter", || {
            Metric::Counter(Counter::default())
        })? {
            Metric::Counter(c) => Ok(c),
            other => Err(conflict(name, other.kind(), "counter")),
        }
    }

    /// Get or create a gauge.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Result<Gauge, RegistryError> {
        match self.get_or_insert(name, labels, "gauge", || Metric::Gauge(Gauge::default()))? {
            Metric::Gauge(g) => Ok(g),
            other => Err(conflict(name, other.kind(), "gauge")),
        }
    }

    /// Get or create a histogram.
    ///
    /// `bounds` only apply when the series is created; an existing series
    /// keeps its original buckets.
    pub fn histogram(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        bounds: &[f64],
    ) -> Result<Histogram, RegistryError> {
        match self.get_or_insert(name, labels, "histogram", || {
            Metric::Histogram(Histogram::with_bounds(bounds))
        })? {
            Metric::Histogram(h) => Ok(h),
            other => Err(conflict(name, other.kind(), "histogram")),
        }
    }

    fn get_or_insert(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        kind: &'static str,
        make: impl FnOnce() -> Metric,
    ) -> Result<Metric, RegistryError> {
        let key = SeriesKey::new(
            sanitize_metric_name(name),
            labels
                .iter()
                .map(|(k, v)| (sanitize_label_name(k), v.to_string()))
                .collect(),
        );

        // Labels are sorted by name, so repeats are adjacent
        if let Some(pair) = key.labels.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(RegistryError::DuplicateLabel {
                label: pair[0].0.clone(),
                name: key.name,
            });
        }

        if let Some(metric) = self.inner.read().series.get(&key) {
            return Ok(metric.clone());
        }

        let mut inner = self.inner.write();

        // Another writer may have created it between the two locks
        if let Some(metric) = inner.series.get(&key) {
            return Ok(metric.clone());
        }

        if let Some(existing) = inner.kinds.get(&key.name)
            && *existing != kind
        {
            return Err(conflict(&key.name, *existing, kind));
        }

        if inner.series.len() >= self.max_series {
            warn!(
                max_series = self.max_series,
                metric = %key.name,
                "Max series limit reached, refusing new series"
            );
            return Err(RegistryError::SeriesLimit {
                name: key.name,
                limit: self.max_series,
            });
        }

        let metric = make();
        debug!(series = %key, kind, "Registered series");
        inner.kinds.insert(key.name.clone(), kind);
        inner.series.insert(key, metric.clone());
        Ok(metric)
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.inner.read().series.len()
    }

    /// Copy every series into an immutable snapshot.
    ///
    /// The registry lock is held only while the handles are cloned; values are
    /// read after it is released, each series atomically.
    pub fn snapshot(&self) -> MetricSnapshot {
        let handles: Vec<(SeriesKey, Metric)> = self
            .inner
            .read()
            .series
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();

        let series = handles
            .into_iter()
            .map(|(key, metric)| SeriesSnapshot {
                key,
                value: metric.sample(),
            })
            .collect();

        MetricSnapshot::new(current_timestamp_millis(), series)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SERIES)
    }
}

/// Shareable registry handle.
pub type SharedRegistry = Arc<MetricsRegistry>;

fn conflict(name: &str, existing: &'static str, requested: &'static str) -> RegistryError {
    RegistryError::TypeConflict {
        name: name.to_string(),
        existing,
        requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_get_or_create_shares_state() {
        let registry = MetricsRegistry::default();
        let a = registry.counter("lookups_total", &[("outcome", "hit")]).unwrap();
        let b = registry.counter("lookups_total", &[("outcome", "hit")]).unwrap();

        a.inc();
        b.inc_by(4);

        assert_eq!(a.get(), 5);
        assert_eq!(registry.series_count(), 1);
    }

    #[test]
    fn test_distinct_labels_are_distinct_series() {
        let registry = MetricsRegistry::default();
        registry.counter("lookups_total", &[("outcome", "hit")]).unwrap().inc();
        registry.counter("lookups_total", &[("outcome", "miss")]).unwrap().inc();

        assert_eq!(registry.series_count(), 2);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let registry = MetricsRegistry::default();
        let a = registry
            .counter("requests", &[("route", "/"), ("status", "200")])
            .unwrap();
        let b = registry
            .counter("requests", &[("status", "200"), ("route", "/")])
            .unwrap();
        a.inc();
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn test_names_are_sanitized() {
        let registry = MetricsRegistry::default();
        registry.gauge("pool.size", &[("db-name", "movies")]).unwrap().set(4.0);

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.find("pool_size", &[("db_name", "movies")]),
            Some(&SampleValue::Gauge(4.0))
        );
    }

    #[test]
    fn test_type_conflict() {
        let registry = MetricsRegistry::default();
        registry.counter("in_flight", &[]).unwrap();

        let err = registry.gauge("in_flight", &[("route", "/")]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::TypeConflict {
                name: "in_flight".to_string(),
                existing: "counter",
                requested: "gauge",
            }
        );
    }

    #[test]
    fn test_series_limit() {
        let registry = MetricsRegistry::new(2);
        for i in 0..2 {
            registry.counter("c", &[("i", &i.to_string())]).unwrap();
        }

        let err = registry.counter("c", &[("i", "2")]).unwrap_err();
        assert!(matches!(err, RegistryError::SeriesLimit { limit: 2, .. }));

        // Existing series stay reachable at the limit
        assert!(registry.counter("c", &[("i", "0")]).is_ok());
    }

    #[test]
    fn test_repeated_label_rejected() {
        let registry = MetricsRegistry::default();

        let err = registry
            .counter("requests", &[("route", "/a"), ("route", "/b")])
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateLabel {
                name: "requests".to_string(),
                label: "route".to_string(),
            }
        );
        assert_eq!(registry.series_count(), 0);
    }

    #[test]
    fn test_labels_colliding_after_sanitizing_rejected() {
        let registry = MetricsRegistry::default();

        let err = registry
            .counter("x_total", &[("db-name", "a"), ("db_name", "b")])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateLabel { ref label, .. } if label == "db_name"
        ));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_gauge_set_and_add() {
        let registry = MetricsRegistry::default();
        let gauge = registry.gauge("in_flight", &[]).unwrap();
        gauge.set(2.0);
        gauge.add(1.5);
        gauge.add(-0.5);
        assert_eq!(gauge.get(), 3.0);
    }

    #[test]
    fn test_histogram_cumulative_snapshot() {
        let registry = MetricsRegistry::default();
        let hist = registry
            .histogram("latency_seconds", &[], &[0.1, 0.5, 1.0])
            .unwrap();

        for v in [0.05, 0.1, 0.3, 0.7, 2.0] {
            hist.observe(v);
        }

        let snap = hist.snapshot();
        assert_eq!(snap.bounds, vec![0.1, 0.5, 1.0]);
        assert_eq!(snap.cumulative_counts, vec![2, 3, 4]);
        assert_eq!(snap.count, 5);
        assert!((snap.sum - 3.15).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_ignores_nan() {
        let registry = MetricsRegistry::default();
        let hist = registry.histogram("h", &[], &DEFAULT_BUCKETS).unwrap();
        hist.observe(f64::NAN);
        assert_eq!(hist.snapshot().count, 0);
    }

    #[test]
    fn test_histogram_bounds_normalized() {
        let registry = MetricsRegistry::default();
        let hist = registry
            .histogram("h", &[], &[1.0, 0.5, f64::INFINITY, 0.5, f64::NAN])
            .unwrap();
        assert_eq!(hist.bounds(), &[0.5, 1.0]);
    }

    #[test]
    fn test_histogram_keeps_original_bounds() {
        let registry = MetricsRegistry::default();
        registry.histogram("h", &[], &[1.0, 2.0]).unwrap();
        let again = registry.histogram("h", &[], &[5.0]).unwrap();
        assert_eq!(again.bounds(), &[1.0, 2.0]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = MetricsRegistry::default();
        let counter = registry.counter("requests", &[]).unwrap();
        counter.inc();

        let snapshot = registry.snapshot();
        counter.inc_by(10);

        assert_eq!(
            snapshot.find("requests", &[]),
            Some(&SampleValue::Counter(1))
        );
        assert!(snapshot.timestamp_ms > 0);
    }

    #[test]
    fn test_concurrent_updates_and_snapshots() {
        let registry = Arc::new(MetricsRegistry::default());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry
                            .counter("requests", &[("worker", &(i % 2).to_string())])
                            .unwrap()
                            .inc();
                    }
                })
            })
            .collect();

        // Snapshots taken mid-flight must never panic or tear a series
        for _ in 0..10 {
            let snapshot = registry.snapshot();
            assert!(snapshot.len() <= 2);
        }

        for w in writers {
            w.join().unwrap();
        }

        let snapshot = registry.snapshot();
        let total: u64 = snapshot
            .series
            .iter()
            .map(|s| match s.value {
                SampleValue::Counter(v) => v,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 8000);
    }
}
