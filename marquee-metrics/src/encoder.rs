//! Snapshot to remote-write payload encoding.
//!
//! A [`MetricSnapshot`] is flattened into Prometheus time series, serialized
//! as a protobuf [`WriteRequest`] and compressed with snappy (block format, as
//! the remote-write protocol requires).

use std::collections::HashMap;

use prost::Message;
use thiserror::Error;

use crate::naming::{format_bound, sanitize_label_name};
use crate::proto::{Label, Sample, TimeSeries, WriteRequest};
use crate::snapshot::{HistogramSnapshot, MetricSnapshot, SampleValue, SeriesKey};

/// `Content-Type` of an encoded payload.
pub const CONTENT_TYPE: &str = "application/x-protobuf";

/// `Content-Encoding` of an encoded payload.
pub const CONTENT_ENCODING: &str = "snappy";

/// Encoding errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Malformed histogram {series}: {reason}")]
    MalformedHistogram { series: String, reason: String },
    #[error("Series {series} has label '{label}' more than once")]
    DuplicateLabel { series: String, label: String },
    #[error("Snappy compression failed: {0}")]
    Compression(#[source] snap::Error),
    #[error("Snappy decompression failed: {0}")]
    Decompression(#[source] snap::Error),
    #[error("Protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// A compressed, ready-to-send remote-write body.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    /// Snappy-compressed protobuf bytes.
    pub body: Vec<u8>,
    /// Serialization scheme, sent as `Content-Type`.
    pub content_type: &'static str,
    /// Compression scheme, sent as `Content-Encoding`.
    pub content_encoding: &'static str,
    /// Number of time series in the request.
    pub series_count: usize,
    /// Size of the protobuf before compression.
    pub uncompressed_len: usize,
}

/// Turns registry snapshots into remote-write payloads.
///
/// Encoding is pure: the same snapshot always yields the same bytes.
#[derive(Debug, Clone)]
pub struct SnapshotEncoder {
    job: String,
    /// Sanitized default labels, sorted by name.
    default_labels: Vec<(String, String)>,
}

impl SnapshotEncoder {
    /// Create an encoder that stamps every series with `job` and
    /// `default_labels` (series labels win on conflict).
    pub fn new(job: impl Into<String>, default_labels: &HashMap<String, String>) -> Self {
        let mut labels: Vec<(String, String)> = default_labels
            .iter()
            .map(|(k, v)| (sanitize_label_name(k), v.clone()))
            .collect();
        labels.sort();
        labels.dedup_by(|a, b| a.0 == b.0);

        Self {
            job: job.into(),
            default_labels: labels,
        }
    }

    /// Encode and compress a snapshot.
    pub fn encode(&self, snapshot: &MetricSnapshot) -> Result<EncodedPayload, EncodeError> {
        let request = self.build_request(snapshot)?;
        let series_count = request.timeseries.len();
        let raw = request.encode_to_vec();
        let body = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(EncodeError::Compression)?;

        Ok(EncodedPayload {
            body,
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
            series_count,
            uncompressed_len: raw.len(),
        })
    }

    /// Flatten a snapshot into an uncompressed write request.
    pub fn build_request(&self, snapshot: &MetricSnapshot) -> Result<WriteRequest, EncodeError> {
        let ts = snapshot.timestamp_ms;
        let mut timeseries = Vec::with_capacity(snapshot.len());

        for series in &snapshot.series {
            match &series.value {
                SampleValue::Counter(v) => {
                    timeseries.push(self.series(&series.key.name, &series.key, None, *v as f64, ts));
                }
                SampleValue::Gauge(v) => {
                    timeseries.push(self.series(&series.key.name, &series.key, None, *v, ts));
                }
                SampleValue::Histogram(h) => {
                    validate_histogram(&series.key, h)?;
                    self.push_histogram(&mut timeseries, &series.key, h, ts);
                }
            }
        }

        for ts in &timeseries {
            check_unique_labels(ts)?;
        }

        Ok(WriteRequest { timeseries })
    }

    fn push_histogram(
        &self,
        out: &mut Vec<TimeSeries>,
        key: &SeriesKey,
        h: &HistogramSnapshot,
        ts: i64,
    ) {
        let bucket_name = format!("{}_bucket", key.name);
        for (bound, count) in h.bounds.iter().zip(&h.cumulative_counts) {
            out.push(self.series(&bucket_name, key, Some(format_bound(*bound)), *count as f64, ts));
        }
        out.push(self.series(&bucket_name, key, Some("+Inf".to_string()), h.count as f64, ts));
        out.push(self.series(&format!("{}_sum", key.name), key, None, h.sum, ts));
        out.push(self.series(&format!("{}_count", key.name), key, None, h.count as f64, ts));
    }

    fn series(
        &self,
        name: &str,
        key: &SeriesKey,
        le: Option<String>,
        value: f64,
        timestamp: i64,
    ) -> TimeSeries {
        let mut labels: Vec<Label> = Vec::with_capacity(key.labels.len() + 3);
        labels.push(label("__name__", name));

        for (k, v) in &key.labels {
            // Bucket series own the `le` label
            if le.is_some() && k == "le" {
                continue;
            }
            labels.push(label(k, v));
        }

        if let Some(le) = le {
            labels.push(label("le", &le));
        }

        if !labels.iter().any(|l| l.name == "job") {
            labels.push(label("job", &self.job));
        }

        for (k, v) in &self.default_labels {
            if !labels.iter().any(|l| &l.name == k) {
                labels.push(label(k, v));
            }
        }

        labels.sort_by(|a, b| a.name.cmp(&b.name));

        TimeSeries {
            labels,
            samples: vec![Sample { value, timestamp }],
        }
    }
}

fn label(name: &str, value: &str) -> Label {
    Label {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Receivers reject a whole request when any series repeats a label name.
fn check_unique_labels(ts: &TimeSeries) -> Result<(), EncodeError> {
    match ts.labels.windows(2).find(|pair| pair[0].name == pair[1].name) {
        Some(pair) => Err(EncodeError::DuplicateLabel {
            series: ts.metric_name().unwrap_or_default().to_string(),
            label: pair[0].name.clone(),
        }),
        None => Ok(()),
    }
}

/// Check that a histogram is structurally sound.
pub fn validate_histogram(key: &SeriesKey, h: &HistogramSnapshot) -> Result<(), EncodeError> {
    let malformed = |reason: String| EncodeError::MalformedHistogram {
        series: key.to_string(),
        reason,
    };

    if h.bounds.len() != h.cumulative_counts.len() {
        return Err(malformed(format!(
            "{} bounds but {} bucket counts",
            h.bounds.len(),
            h.cumulative_counts.len()
        )));
    }

    if let Some(bad) = h.bounds.iter().find(|b| !b.is_finite()) {
        return Err(malformed(format!("non-finite bound {}", bad)));
    }

    if h.bounds.windows(2).any(|w| w[0] >= w[1]) {
        return Err(malformed("bounds are not strictly increasing".to_string()));
    }

    if h.cumulative_counts.windows(2).any(|w| w[0] > w[1]) {
        return Err(malformed("cumulative counts decrease".to_string()));
    }

    if let Some(last) = h.cumulative_counts.last()
        && *last > h.count
    {
        return Err(malformed(format!(
            "last bucket count {} exceeds total count {}",
            last, h.count
        )));
    }

    Ok(())
}

/// Decompress and decode a payload produced by [`SnapshotEncoder::encode`].
pub fn decode_payload(body: &[u8]) -> Result<WriteRequest, EncodeError> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(EncodeError::Decompression)?;
    Ok(WriteRequest::decode(raw.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SeriesSnapshot;

    fn key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
        SeriesKey::new(
            name,
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn encoder() -> SnapshotEncoder {
        SnapshotEncoder::new("movie-api", &HashMap::new())
    }

    fn histogram(bounds: Vec<f64>, counts: Vec<u64>, count: u64) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds,
            cumulative_counts: counts,
            count,
            sum: 1.0,
        }
    }

    #[test]
    fn test_empty_snapshot_encodes() {
        let payload = encoder().encode(&MetricSnapshot::empty(1)).unwrap();

        assert_eq!(payload.series_count, 0);
        assert_eq!(payload.content_type, "application/x-protobuf");
        assert_eq!(payload.content_encoding, "snappy");
        assert!(!payload.body.is_empty());

        let decoded = decode_payload(&payload.body).unwrap();
        assert!(decoded.timeseries.is_empty());
    }

    #[test]
    fn test_counter_series_labels() {
        let snapshot = MetricSnapshot::new(
            42,
            vec![SeriesSnapshot {
                key: key("http_requests_total", &[("status", "200"), ("route", "/")]),
                value: SampleValue::Counter(7),
            }],
        );

        let request = encoder().build_request(&snapshot).unwrap();
        assert_eq!(request.timeseries.len(), 1);

        let ts = &request.timeseries[0];
        let names: Vec<&str> = ts.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job", "route", "status"]);
        assert_eq!(ts.metric_name(), Some("http_requests_total"));
        assert_eq!(ts.label("job"), Some("movie-api"));
        assert_eq!(ts.samples, vec![Sample { value: 7.0, timestamp: 42 }]);
    }

    #[test]
    fn test_default_labels_do_not_override() {
        let mut defaults = HashMap::new();
        defaults.insert("env".to_string(), "prod".to_string());
        defaults.insert("route".to_string(), "ignored".to_string());
        let encoder = SnapshotEncoder::new("movie-api", &defaults);

        let snapshot = MetricSnapshot::new(
            1,
            vec![SeriesSnapshot {
                key: key("hits", &[("route", "/by-title")]),
                value: SampleValue::Gauge(1.0),
            }],
        );

        let request = encoder.build_request(&snapshot).unwrap();
        let ts = &request.timeseries[0];
        assert_eq!(ts.label("env"), Some("prod"));
        assert_eq!(ts.label("route"), Some("/by-title"));
    }

    #[test]
    fn test_histogram_expansion() {
        let snapshot = MetricSnapshot::new(
            5,
            vec![SeriesSnapshot {
                key: key("latency_seconds", &[("route", "/")]),
                value: SampleValue::Histogram(HistogramSnapshot {
                    bounds: vec![0.1, 1.0],
                    cumulative_counts: vec![2, 3],
                    count: 4,
                    sum: 2.5,
                }),
            }],
        );

        let request = encoder().build_request(&snapshot).unwrap();
        let rendered: Vec<(String, Option<String>, f64)> = request
            .timeseries
            .iter()
            .map(|ts| {
                (
                    ts.metric_name().unwrap().to_string(),
                    ts.label("le").map(str::to_string),
                    ts.samples[0].value,
                )
            })
            .collect();

        assert_eq!(
            rendered,
            vec![
                ("latency_seconds_bucket".into(), Some("0.1".into()), 2.0),
                ("latency_seconds_bucket".into(), Some("1.0".into()), 3.0),
                ("latency_seconds_bucket".into(), Some("+Inf".into()), 4.0),
                ("latency_seconds_sum".into(), None, 2.5),
                ("latency_seconds_count".into(), None, 4.0),
            ]
        );
    }

    #[test]
    fn test_malformed_histograms_rejected() {
        let cases = vec![
            histogram(vec![0.1, 1.0], vec![1], 1),
            histogram(vec![1.0, 0.1], vec![1, 2], 2),
            histogram(vec![0.1, 0.1], vec![1, 2], 2),
            histogram(vec![0.1, f64::NAN], vec![1, 2], 2),
            histogram(vec![0.1, 1.0], vec![3, 2], 3),
            histogram(vec![0.1, 1.0], vec![1, 5], 4),
        ];

        for h in cases {
            let snapshot = MetricSnapshot::new(
                1,
                vec![SeriesSnapshot {
                    key: key("broken", &[]),
                    value: SampleValue::Histogram(h.clone()),
                }],
            );
            let err = encoder().encode(&snapshot).unwrap_err();
            assert!(
                matches!(err, EncodeError::MalformedHistogram { .. }),
                "expected malformed error for {:?}, got {:?}",
                h,
                err
            );
        }
    }

    #[test]
    fn test_repeated_label_rejected() {
        let snapshot = MetricSnapshot::new(
            1,
            vec![
                SeriesSnapshot {
                    key: key("fine_total", &[("route", "/")]),
                    value: SampleValue::Counter(1),
                },
                SeriesSnapshot {
                    key: key("requests_total", &[("route", "/a"), ("route", "/b")]),
                    value: SampleValue::Counter(2),
                },
            ],
        );

        let err = encoder().encode(&snapshot).unwrap_err();
        match err {
            EncodeError::DuplicateLabel { series, label } => {
                assert_eq!(series, "requests_total");
                assert_eq!(label, "route");
            }
            other => panic!("expected duplicate label error, got {:?}", other),
        }
    }

    #[test]
    fn test_histogram_with_repeated_label_rejected() {
        let snapshot = MetricSnapshot::new(
            1,
            vec![SeriesSnapshot {
                key: key("latency_seconds", &[("db_name", "a"), ("db_name", "b")]),
                value: SampleValue::Histogram(histogram(vec![0.1], vec![1], 1)),
            }],
        );

        let err = encoder().build_request(&snapshot).unwrap_err();
        assert!(matches!(err, EncodeError::DuplicateLabel { .. }), "{:?}", err);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let snapshot = MetricSnapshot::new(
            9,
            vec![
                SeriesSnapshot {
                    key: key("a_total", &[("x", "1")]),
                    value: SampleValue::Counter(1),
                },
                SeriesSnapshot {
                    key: key("b", &[]),
                    value: SampleValue::Gauge(0.25),
                },
            ],
        );

        let first = encoder().encode(&snapshot).unwrap();
        let second = encoder().encode(&snapshot).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compression_shrinks_redundant_labels() {
        let series = (0..50)
            .map(|i| SeriesSnapshot {
                key: key(
                    "http_requests_total",
                    &[
                        ("route", "/api/v1/recommendations/by-title"),
                        ("method", "GET"),
                        ("status", &format!("{}", 200 + i)),
                    ],
                ),
                value: SampleValue::Counter(i),
            })
            .collect();
        let payload = encoder()
            .encode(&MetricSnapshot::new(1_700_000_000_000, series))
            .unwrap();

        assert!(payload.body.len() < payload.uncompressed_len);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_payload(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, EncodeError::Decompression(_)));
    }
}
