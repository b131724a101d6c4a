//! Metrics collection and Prometheus remote-write export for Marquee.
//!
//! Request handlers record into a shared [`MetricsRegistry`]. A
//! [`RemoteWriteExporter`] periodically snapshots the registry, encodes the
//! snapshot as a snappy-compressed remote-write request and posts it to the
//! configured endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │    Handlers     │────>│    Registry     │────>│     Encoder     │────>│    Transport    │
//! │ (inc / observe) │     │   (snapshot)    │     │ (protobuf+snap) │     │   (HTTP POST)   │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//!                                  ^                                               |
//!                                  └────────── RemoteWriteExporter (every N s) ────┘
//! ```
//!
//! # Configuration
//!
//! The exporter reads `METRICS_ENDPOINT`, `METRICS_USERNAME` and
//! `METRICS_PASSWORD`; it stays disabled unless all three are set. See
//! [`config::ExporterConfig`] for the remaining options.

pub mod config;
pub mod encoder;
pub mod exporter;
pub mod naming;
pub mod proto;
pub mod registry;
pub mod snapshot;
pub mod transport;

pub use config::{ConfigError, Credentials, ExporterConfig};
pub use encoder::{EncodeError, EncodedPayload, SnapshotEncoder, decode_payload};
pub use exporter::{ExporterError, ExporterStats, ExporterStatus, RemoteWriteExporter};
pub use registry::{
    Counter, DEFAULT_BUCKETS, Gauge, Histogram, MetricsRegistry, RegistryError, SharedRegistry,
};
pub use snapshot::{MetricSnapshot, SampleValue, SeriesKey};
pub use transport::{HttpTransport, Transport, TransportError};
