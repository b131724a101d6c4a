//! Best-effort log shipping to Grafana Loki.
//!
//! [`LokiLayer`] turns each tracing event into a JSON line and queues it
//! without blocking. [`LokiShipper`] drains the queue in batches and posts
//! them to the Loki push API. A full queue drops lines; a failed push drops
//! the batch. Neither ever surfaces an error to the application.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use marquee_common::{current_timestamp_millis, current_timestamp_nanos};

use crate::config::LokiConfig;

/// Push request timeout.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Event targets never shipped, so the shipper's own HTTP client cannot feed
/// its queue.
const IGNORED_TARGETS: &[&str] = &["hyper", "h2", "reqwest", "rustls", "tower"];

/// One formatted log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp_ns: i128,
    pub line: String,
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(rendered));
        }
    }
}

/// Format an event as a single JSON object.
fn format_event(event: &Event<'_>) -> String {
    let meta = event.metadata();
    let mut visitor = JsonVisitor::default();
    event.record(&mut visitor);

    let mut line = Map::new();
    line.insert("level".into(), Value::from(meta.level().as_str()));
    line.insert("timestamp".into(), Value::from(current_timestamp_millis()));
    line.insert("logger".into(), Value::from(meta.target()));
    line.insert(
        "message".into(),
        Value::from(visitor.message.unwrap_or_default()),
    );
    if !visitor.fields.is_empty() {
        line.insert("fields".into(), Value::Object(visitor.fields));
    }

    Value::Object(line).to_string()
}

/// Tracing layer queueing events for Loki.
#[derive(Debug, Clone)]
pub struct LokiLayer {
    sender: mpsc::Sender<LogLine>,
}

impl<S: Subscriber> Layer<S> for LokiLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if IGNORED_TARGETS.iter().any(|t| target.starts_with(t)) {
            return;
        }

        let line = LogLine {
            timestamp_ns: current_timestamp_nanos(),
            line: format_event(event),
        };
        // Full or closed queue: drop the line
        let _ = self.sender.try_send(line);
    }
}

/// Background task posting queued lines to Loki.
pub struct LokiShipper {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    labels: BTreeMap<String, String>,
    receiver: mpsc::Receiver<LogLine>,
    batch_size: usize,
    flush_interval: Duration,
}

/// Stream labels attached to every pushed line.
pub fn stream_labels(environment: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "movie-api".to_string()),
        ("environment".to_string(), environment.to_string()),
        ("service".to_string(), "recommendation-api".to_string()),
    ])
}

/// Build the layer and shipper pair, or `None` when Loki is not configured.
pub fn loki_sink(config: &LokiConfig) -> Option<(LokiLayer, LokiShipper)> {
    if !config.is_enabled() {
        return None;
    }
    let (Some(url), Some(username), Some(password)) =
        (&config.url, &config.username, &config.password)
    else {
        return None;
    };

    let client = reqwest::Client::builder()
        .timeout(PUSH_TIMEOUT)
        .build()
        .ok()?;

    let (sender, receiver) = mpsc::channel(config.queue_capacity);

    let shipper = LokiShipper {
        client,
        url: url.trim().to_string(),
        username: username.trim().to_string(),
        password: password.clone(),
        labels: stream_labels(&config.environment),
        receiver,
        batch_size: config.batch_size,
        flush_interval: Duration::from_millis(config.flush_interval_ms),
    };

    Some((LokiLayer { sender }, shipper))
}

/// Loki push API request body for a batch of lines.
pub fn push_body(labels: &BTreeMap<String, String>, lines: &[LogLine]) -> Value {
    let values: Vec<Value> = lines
        .iter()
        .map(|l| json!([l.timestamp_ns.to_string(), l.line]))
        .collect();

    json!({
        "streams": [
            {
                "stream": labels,
                "values": values,
            }
        ]
    })
}

impl LokiShipper {
    /// Ship lines until shutdown, then flush what is left.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                line = self.receiver.recv() => {
                    let Some(line) = line else {
                        break;
                    };
                    batch.push(line);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        while let Ok(line) = self.receiver.try_recv() {
            batch.push(line);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
    }

    async fn flush(&self, batch: &mut Vec<LogLine>) {
        let body = push_body(&self.labels, batch);
        batch.clear();

        // Errors are discarded; logging them would feed this queue
        let _ = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await;
    }
}
