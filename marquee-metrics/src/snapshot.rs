//! Point-in-time copies of registry contents.

use std::fmt;

/// A unique identifier for a metric time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The sanitized metric name.
    pub name: String,
    /// Sorted label key-value pairs.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Create a series key, sorting labels for consistent hashing.
    pub fn new(name: impl Into<String>, mut labels: Vec<(String, String)>) -> Self {
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels,
        }
    }

    /// Get the value of a label, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.labels.is_empty() {
            let parts: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            write!(f, "{{{}}}", parts.join(","))?;
        }
        Ok(())
    }
}

/// Histogram state captured at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Finite upper bounds, strictly increasing.
    pub bounds: Vec<f64>,
    /// Cumulative observation count for each bound.
    pub cumulative_counts: Vec<u64>,
    /// Total observations, including those above the last bound.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
}

/// The value of one series at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    /// Monotonically increasing counter.
    Counter(u64),
    /// Value that can go up or down.
    Gauge(f64),
    /// Bucketed distribution.
    Histogram(HistogramSnapshot),
}

/// One series in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub value: SampleValue,
}

/// An immutable copy of every series in a registry.
///
/// Each series is read atomically; two series in the same snapshot may be
/// slightly skewed relative to each other.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    /// Capture time in milliseconds since Unix epoch.
    pub timestamp_ms: i64,
    /// Series sorted by key.
    pub series: Vec<SeriesSnapshot>,
}

impl MetricSnapshot {
    /// Create a snapshot from a list of series, sorting them by key.
    pub fn new(timestamp_ms: i64, mut series: Vec<SeriesSnapshot>) -> Self {
        series.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            timestamp_ms,
            series,
        }
    }

    /// Create a snapshot with no series.
    pub fn empty(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            series: Vec::new(),
        }
    }

    /// Number of series in the snapshot.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the snapshot holds no series.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Find a series by name and exact label set.
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&SampleValue> {
        let key = SeriesKey::new(
            name,
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.series
            .binary_search_by(|s| s.key.cmp(&key))
            .ok()
            .map(|i| &self.series[i].value)
    }
}
