//! Movie recommendation API.
//!
//! Serves similarity-based movie recommendations over HTTP, records request
//! metrics into a [`marquee_metrics::MetricsRegistry`] and pushes them to a
//! Prometheus remote-write endpoint in the background.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   HTTP Server   │────>│   Recommender   │────>│    Supabase     │
//! │  (axum router)  │     │   (REST/RPC)    │     │   (pgvector)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!          │
//!          v
//! ┌─────────────────┐     ┌─────────────────┐
//! │ MetricsRegistry │────>│  Remote write   │
//! │                 │     │    exporter     │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! SUPABASE_URL=... SUPABASE_KEY=... marquee --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ApiConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod loki;
pub mod recommender;

pub use config::ApiConfig;
pub use http::{HttpServer, create_router};
pub use loki::{LokiLayer, LokiShipper, loki_sink};
pub use recommender::{MovieRecommendation, RecommendError, Recommender, SupabaseRecommender};
