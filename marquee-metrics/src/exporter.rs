//! Background remote-write exporter.
//!
//! The exporter owns one tokio task that waits for the push interval, takes a
//! registry snapshot, encodes it and hands it to a [`Transport`]. Failed
//! pushes are logged and skipped; the next tick starts over from a fresh
//! snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use marquee_common::current_timestamp_millis;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ExporterConfig;
use crate::encoder::{EncodeError, SnapshotEncoder};
use crate::registry::{Counter, SharedRegistry};
use crate::snapshot::MetricSnapshot;
use crate::transport::{HttpTransport, Transport, TransportError};

/// Name of the self-instrumentation counter, labelled by `outcome`.
pub const PUSHES_METRIC: &str = "marquee_remote_write_pushes_total";

/// Exporter construction errors.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("Failed to create transport: {0}")]
    Transport(#[from] TransportError),
}

/// Why a single push cycle failed.
#[derive(Debug, Error)]
enum PushError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle state of an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterStatus {
    /// Configuration incomplete; `start` and `stop` do nothing.
    Disabled,
    /// Configured but not running.
    Stopped,
    /// Background loop active.
    Running,
    /// `stop` is waiting for the loop to exit.
    Stopping,
}

impl std::fmt::Display for ExporterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExporterStatus::Disabled => write!(f, "disabled"),
            ExporterStatus::Stopped => write!(f, "stopped"),
            ExporterStatus::Running => write!(f, "running"),
            ExporterStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Exporter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExporterStats {
    /// Push cycles started.
    pub ticks: u64,
    /// Payloads accepted by the remote end.
    pub pushes_succeeded: u64,
    /// Transport failures, non-2xx responses and crashed cycles.
    pub pushes_failed: u64,
    /// Snapshots that could not be encoded.
    pub encode_failures: u64,
    /// When the last successful push completed (ms since Unix epoch).
    pub last_success_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    ticks: AtomicU64,
    pushes_succeeded: AtomicU64,
    pushes_failed: AtomicU64,
    encode_failures: AtomicU64,
    last_success_ms: AtomicI64,
}

/// Counters written back into the registry being exported.
#[derive(Debug)]
struct OutcomeCounters {
    success: Counter,
    failure: Counter,
    encode_error: Counter,
}

impl OutcomeCounters {
    fn register(registry: &SharedRegistry) -> Self {
        let counter = |outcome: &str| {
            registry
                .counter(PUSHES_METRIC, &[("outcome", outcome)])
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Exporter self-instrumentation unavailable");
                    Counter::default()
                })
        };

        Self {
            success: counter("success"),
            failure: counter("failure"),
            encode_error: counter("encode_error"),
        }
    }
}

/// Everything one push cycle needs, shared with the background task.
struct PushContext<T> {
    registry: SharedRegistry,
    encoder: SnapshotEncoder,
    transport: T,
    stats: StatsCounters,
    outcomes: OutcomeCounters,
}

impl<T: Transport> PushContext<T> {
    async fn push_once(&self, snapshot: &MetricSnapshot) -> Result<(usize, usize), PushError> {
        let payload = self.encoder.encode(snapshot)?;
        let sizes = (payload.series_count, payload.body.len());
        self.transport.push(payload).await?;
        Ok(sizes)
    }

    async fn tick(self: Arc<Self>) {
        let snapshot = self.registry.snapshot();
        self.push_snapshot(snapshot).await;
    }

    async fn push_snapshot(self: Arc<Self>, snapshot: MetricSnapshot) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        // A panicking transport must not take the loop down with it
        let cycle = tokio::spawn({
            let context = self.clone();
            async move { context.push_once(&snapshot).await }
        });

        match cycle.await {
            Ok(Ok((series, bytes))) => {
                self.stats.pushes_succeeded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .last_success_ms
                    .store(current_timestamp_millis(), Ordering::Relaxed);
                self.outcomes.success.inc();
                debug!(
                    url = %self.transport.target(),
                    series,
                    bytes,
                    "Pushed metrics"
                );
            }
            Ok(Err(PushError::Encode(e))) => {
                self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                self.outcomes.encode_error.inc();
                error!(error = %e, "Failed to encode metrics snapshot, skipping this push");
            }
            Ok(Err(PushError::Transport(e))) => {
                self.stats.pushes_failed.fetch_add(1, Ordering::Relaxed);
                self.outcomes.failure.inc();
                error!(
                    url = %self.transport.target(),
                    status = e.status(),
                    error = %e,
                    "Failed to push metrics"
                );
            }
            Err(e) => {
                self.stats.pushes_failed.fetch_add(1, Ordering::Relaxed);
                self.outcomes.failure.inc();
                error!(error = %e, "Push cycle crashed");
            }
        }
    }

    fn stats(&self) -> ExporterStats {
        let last = self.stats.last_success_ms.load(Ordering::Relaxed);
        ExporterStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            pushes_succeeded: self.stats.pushes_succeeded.load(Ordering::Relaxed),
            pushes_failed: self.stats.pushes_failed.load(Ordering::Relaxed),
            encode_failures: self.stats.encode_failures.load(Ordering::Relaxed),
            last_success_ms: (last > 0).then_some(last),
        }
    }
}

async fn run_loop<T: Transport>(
    context: Arc<PushContext<T>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // A dropped sender means the exporter itself is gone
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                context.clone().tick().await;
            }
        }
    }

    debug!("Remote write loop exited");
}

#[derive(Debug, Default)]
struct ExporterState {
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
    stopping: bool,
    /// Loop that outlived a `stop` timeout and is finishing its last push.
    draining: Option<JoinHandle<()>>,
}

/// Periodically pushes registry snapshots to a remote-write endpoint.
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(MetricsRegistry::default());
/// let exporter = RemoteWriteExporter::new(ExporterConfig::from_env()?, registry.clone())?;
///
/// exporter.start();
/// // ... serve requests ...
/// exporter.stop(Duration::from_secs(5)).await;
/// ```
pub struct RemoteWriteExporter<T: Transport = HttpTransport> {
    config: ExporterConfig,
    /// `None` when the configuration is incomplete.
    context: Option<Arc<PushContext<T>>>,
    state: Mutex<ExporterState>,
}

impl RemoteWriteExporter<HttpTransport> {
    /// Create an exporter that posts over HTTP.
    ///
    /// An incomplete configuration yields a disabled exporter, not an error.
    pub fn new(config: ExporterConfig, registry: SharedRegistry) -> Result<Self, ExporterError> {
        let transport = match config.endpoint() {
            Some(url) if config.is_enabled() => Some(HttpTransport::new(
                url,
                config.credentials(),
                config.timeout(),
            )?),
            _ => None,
        };
        Ok(Self::build(config, registry, transport))
    }
}

impl<T: Transport> RemoteWriteExporter<T> {
    /// Create an exporter with a custom transport.
    pub fn with_transport(config: ExporterConfig, registry: SharedRegistry, transport: T) -> Self {
        Self::build(config, registry, Some(transport))
    }

    fn build(config: ExporterConfig, registry: SharedRegistry, transport: Option<T>) -> Self {
        let context = transport.filter(|_| config.is_enabled()).map(|transport| {
            Arc::new(PushContext {
                encoder: SnapshotEncoder::new(config.job.clone(), &config.default_labels),
                outcomes: OutcomeCounters::register(&registry),
                registry,
                transport,
                stats: StatsCounters::default(),
            })
        });

        Self {
            config,
            context,
            state: Mutex::new(ExporterState::default()),
        }
    }

    /// The configuration this exporter was built from.
    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Spawn the background loop on the current tokio runtime.
    ///
    /// Does nothing when disabled, already running, or while a loop abandoned
    /// by [`stop`](Self::stop) is still finishing.
    pub fn start(&self) {
        let Some(context) = &self.context else {
            info!("Remote write exporter is not configured, skipping");
            return;
        };

        let mut state = self.state.lock();
        if let Some(task) = &state.task
            && !task.is_finished()
        {
            debug!("Remote write exporter already running");
            return;
        }

        if let Some(task) = &state.draining
            && !task.is_finished()
        {
            warn!("Previous remote write loop is still finishing a push, not starting");
            return;
        }
        state.draining = None;

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "No tokio runtime, remote write exporter not started");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = self.config.push_interval();

        info!(
            url = %context.transport.target(),
            interval_secs = self.config.push_interval_secs,
            "Starting remote write exporter"
        );

        state.task = Some(runtime.spawn(run_loop(context.clone(), period, shutdown_rx)));
        state.shutdown = Some(shutdown_tx);
    }

    /// Signal the loop to stop and wait up to `wait_timeout` for it.
    ///
    /// A loop that does not exit in time is left to finish its current push
    /// on its own; until it does, the exporter reports
    /// [`ExporterStatus::Stopping`] and refuses to start. Safe to call from
    /// any task, any number of times.
    pub async fn stop(&self, wait_timeout: Duration) {
        let (mut task, shutdown) = {
            let mut state = self.state.lock();
            let Some(task) = state.task.take() else {
                return;
            };
            state.stopping = true;
            (task, state.shutdown.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        let outcome = tokio::time::timeout(wait_timeout, &mut task).await;
        let draining = match outcome {
            Ok(Ok(())) => {
                info!("Remote write exporter stopped");
                None
            }
            Ok(Err(e)) => {
                error!(error = %e, "Remote write exporter task failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = wait_timeout.as_millis() as u64,
                    "Remote write exporter did not stop in time, leaving it to finish"
                );
                Some(task)
            }
        };

        let mut state = self.state.lock();
        state.stopping = false;
        state.draining = draining;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExporterStatus {
        if self.context.is_none() {
            return ExporterStatus::Disabled;
        }

        let state = self.state.lock();
        if state.stopping || state.draining.as_ref().is_some_and(|t| !t.is_finished()) {
            ExporterStatus::Stopping
        } else if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            ExporterStatus::Running
        } else {
            ExporterStatus::Stopped
        }
    }

    /// Whether the background loop is active.
    pub fn is_running(&self) -> bool {
        self.state() == ExporterStatus::Running
    }

    /// Push statistics so far; all zero when disabled.
    pub fn stats(&self) -> ExporterStats {
        self.context
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }
}
