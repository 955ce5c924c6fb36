//! RelayService: transport-agnostic request/reply relay.
//!
//! This service owns:
//! - The subprocess sink (stdin writer)
//! - The correlator (pending waiters and their deadlines)
//! - Dispatch ordering and shutdown coordination
//!
//! Transports (HTTP today) hand it raw bodies and get back the reply or a
//! `RelayError`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::correlation::{CorrelationMode, Correlator};
use crate::error::RelayError;
use crate::framing;
use crate::health::{HealthSnapshot, VersionInfo};
use crate::stats::RelayStats;
use crate::subprocess::{MessageSink, SpawnError, SubprocessChannel, SubprocessConfig};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(8000);

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Per-request deadline.
    pub timeout: Duration,
    pub correlation: CorrelationMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            correlation: CorrelationMode::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_correlation(mut self, mode: CorrelationMode) -> Self {
        self.correlation = mode;
        self
    }
}

/// Shared relay context, built once at startup and handed to every handler.
pub struct RelayService {
    sink: Arc<dyn MessageSink>,
    correlator: Arc<Correlator>,
    stats: Arc<RelayStats>,
    /// Held across enqueue + write so queue order equals wire order.
    dispatch: tokio::sync::Mutex<()>,
    timeout: Duration,
    shutting_down: AtomicBool,
    version: VersionInfo,
}

impl RelayService {
    /// Build around an existing sink and correlator.
    ///
    /// Whoever feeds subprocess output must deliver it to this correlator.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        correlator: Arc<Correlator>,
        stats: Arc<RelayStats>,
        timeout: Duration,
    ) -> Self {
        Self {
            sink,
            correlator,
            stats,
            dispatch: tokio::sync::Mutex::new(()),
            timeout,
            shutting_down: AtomicBool::new(false),
            version: VersionInfo::default(),
        }
    }

    /// Spawn the subprocess and start draining its stdout into the correlator.
    pub fn start(subprocess: &SubprocessConfig, config: RelayConfig) -> Result<Self, SpawnError> {
        let stats = Arc::new(RelayStats::new());
        let (channel, messages) = SubprocessChannel::start(subprocess, Arc::clone(&stats))?;
        let correlator = Arc::new(Correlator::new(config.correlation, Arc::clone(&stats)));

        tokio::spawn(pump_messages(messages, Arc::clone(&correlator)));

        tracing::info!(
            timeout_ms = config.timeout.as_millis() as u64,
            correlation = ?config.correlation,
            "Relay ready"
        );
        Ok(Self::new(
            Arc::new(channel),
            correlator,
            stats,
            config.timeout,
        ))
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Relay a raw payload with the configured timeout.
    pub async fn relay(&self, payload: &[u8]) -> Result<Value, RelayError> {
        self.relay_with_timeout(payload, self.timeout).await
    }

    /// Parse `payload` (framed or bare JSON), send it, and wait for the reply.
    ///
    /// A malformed payload fails before the subprocess is contacted.
    pub async fn relay_with_timeout(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let Some(message) = framing::decode_payload(payload) else {
            tracing::debug!(payload_bytes = payload.len(), "Rejecting malformed payload");
            return Err(RelayError::MalformedPayload);
        };
        self.relay_message(message, timeout).await
    }

    pub async fn relay_message(
        &self,
        message: Value,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let waiter = {
            let _dispatch = self.dispatch.lock().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(RelayError::ShuttingDown);
            }

            let waiter = self.correlator.enqueue(&message, timeout);
            if let Err(e) = self.sink.send(&message).await {
                tracing::warn!(ticket = waiter.ticket(), error = %e, "Failed to send to subprocess");
                self.correlator.cancel(waiter);
                return Err(RelayError::SubprocessUnavailable(e.to_string()));
            }
            waiter
        };

        let reply = waiter.wait().await;
        if reply.is_ok() {
            self.stats.record_relayed();
        }
        reply
    }

    pub fn health(&self) -> HealthSnapshot {
        let subprocess = self.sink.status();
        HealthSnapshot {
            ok: subprocess.is_running() && !self.is_shutting_down(),
            subprocess,
            pending: self.correlator.pending(),
            stats: self.stats.snapshot(),
            version: self.version.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Refuse new requests, fail every pending one, and stop the subprocess.
    pub async fn shutdown(&self) {
        {
            let _dispatch = self.dispatch.lock().await;
            if self.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
            self.correlator.fail_all(RelayError::ShuttingDown);
        }
        self.sink.terminate().await;
    }
}

/// Drain decoded subprocess output into the correlator until the stream ends.
pub async fn pump_messages<S>(mut messages: S, correlator: Arc<Correlator>)
where
    S: Stream<Item = std::io::Result<Value>> + Unpin,
{
    while let Some(item) = messages.next().await {
        match item {
            Ok(message) => {
                correlator.resolve(message);
            }
            Err(e) => {
                tracing::error!(error = %e, "Subprocess output error");
                break;
            }
        }
    }
    tracing::info!(pending = correlator.pending(), "Subprocess output closed");
}
