//! Per-session coordination.
//!
//! A [`SessionCoordinator`] owns one accepted client connection. It dials the
//! upstream broker, then runs one [`RelayPipeline`] per direction as separate
//! tasks. When either pipeline stops, or the proxy shuts down, both are
//! cancelled and joined, both sockets are dropped, and the session's trace
//! file is closed exactly once. A pipeline still stuck writing to a peer that
//! has stopped reading is aborted after a short grace period.
//!
//! # Lifecycle
//!
//! `Listening -> Accepted -> UpstreamConnecting -> Relaying -> Closed`
//!
//! A failed dial goes straight from `UpstreamConnecting` to `Closed`; the
//! client socket is closed without any bytes relayed.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::sinks::{ConsoleSink, PduSink, TraceRecorder};

use super::codec::MqttCodec;
use super::relay::{Direction, RelayEnd, RelayPipeline, RelayStats};

/// How long a pipeline may keep writing after teardown starts before it is
/// aborted and its sockets dropped.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Logs at info when the session is verbose, debug otherwise.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Accepted,
    UpstreamConnecting,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listening => "listening",
            Self::Accepted => "accepted",
            Self::UpstreamConnecting => "upstream_connecting",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a relaying session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// A peer closed its connection between PDUs.
    EndOfStream(Direction),
    /// A pipeline failed; `kind` is the error's short label.
    Error {
        direction: Direction,
        kind: &'static str,
    },
    /// The proxy is shutting down.
    Shutdown,
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream(direction) => write!(f, "eof ({direction})"),
            Self::Error { direction, kind } => write!(f, "{kind} error ({direction})"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: u64,
    pub peer: SocketAddr,
    /// Counters for the client to broker pipeline; `None` if it failed.
    pub client_to_broker: Option<RelayStats>,
    /// Counters for the broker to client pipeline; `None` if it failed.
    pub broker_to_client: Option<RelayStats>,
    pub cause: TeardownCause,
    /// Trace file written for this session, if any.
    pub trace_path: Option<PathBuf>,
    pub duration: Duration,
}

/// Drives a single proxied session from accept to teardown.
pub struct SessionCoordinator {
    config: Arc<ProxyConfig>,
    shutdown_rx: broadcast::Receiver<()>,
    session_id: u64,
    state: SessionState,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl SessionCoordinator {
    /// Create a coordinator for one session.
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        shutdown_rx: broadcast::Receiver<()>,
        session_id: u64,
    ) -> Self {
        Self {
            config,
            shutdown_rx,
            session_id,
            state: SessionState::Listening,
            metrics: None,
        }
    }

    /// Record session and traffic metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = %self.state, to = %next, "session state");
        self.state = next;
    }

    /// Proxy `inbound` to the configured upstream until either side closes.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UpstreamConnect`] if the upstream broker cannot
    /// be reached. Failures after the dial end the session normally and are
    /// reported through [`SessionReport::cause`].
    #[instrument(skip(self, inbound), fields(session = self.session_id, peer = %peer))]
    pub async fn handle(mut self, inbound: TcpStream, peer: SocketAddr) -> Result<SessionReport> {
        let started = Instant::now();
        let verbose = self.config.verbose;
        self.transition(SessionState::Accepted);
        lifecycle!(verbose, "client connected");

        self.transition(SessionState::UpstreamConnecting);
        let upstream_address = self.config.upstream.address.clone();
        let outbound = match TcpStream::connect(&upstream_address).await {
            Ok(stream) => stream,
            Err(source) => {
                self.transition(SessionState::Closed);
                warn!(upstream = %upstream_address, error = %source, "upstream dial failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_upstream_failure();
                    metrics.record_session_error("upstream_connect");
                }
                drop(inbound);
                return Err(ProxyError::UpstreamConnect {
                    address: upstream_address,
                    source,
                });
            }
        };
        lifecycle!(verbose, upstream = %upstream_address, "upstream connected");

        for stream in [&inbound, &outbound] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY");
            }
        }

        let recorder = self.open_recorder(&peer).await;
        let trace_path = recorder.as_ref().map(|r| r.path().to_path_buf());

        self.transition(SessionState::Relaying);
        let cancel = CancellationToken::new();
        let (client_read, client_write) = inbound.into_split();
        let (broker_read, broker_write) = outbound.into_split();

        let upstream = self
            .pipeline(Direction::ClientToBroker, &cancel, recorder.as_ref())
            .run(client_read, broker_write);
        let downstream = self
            .pipeline(Direction::BrokerToClient, &cancel, recorder.as_ref())
            .run(broker_read, client_write);
        let upstream: JoinHandle<Result<RelayStats>> = tokio::spawn(upstream);
        let downstream: JoinHandle<Result<RelayStats>> = tokio::spawn(downstream);

        let shutdown = tokio::select! {
            () = cancel.cancelled() => false,
            _ = self.shutdown_rx.recv() => {
                debug!("shutdown during session");
                cancel.cancel();
                true
            }
        };

        let (upstream, downstream) = tokio::join!(
            join_within(upstream, TEARDOWN_GRACE),
            join_within(downstream, TEARDOWN_GRACE)
        );

        if let Some(recorder) = recorder {
            if let Err(e) = recorder.close().await {
                warn!(path = %recorder.path().display(), error = %e, "failed to close trace file");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sink_error("trace");
                }
            }
        }
        self.transition(SessionState::Closed);

        let cause = teardown_cause(shutdown, &upstream, &downstream);
        for (direction, result) in [
            (Direction::ClientToBroker, &upstream),
            (Direction::BrokerToClient, &downstream),
        ] {
            if let Err(e) = result {
                warn!(%direction, error = %e, "relay error");
                if let Some(metrics) = &self.metrics {
                    metrics.record_session_error(e.kind());
                }
            }
        }

        let report = SessionReport {
            session_id: self.session_id,
            peer,
            client_to_broker: upstream.ok(),
            broker_to_client: downstream.ok(),
            cause,
            trace_path,
            duration: started.elapsed(),
        };

        info!(
            sent_pdus = report.client_to_broker.map_or(0, |s| s.pdus),
            sent_bytes = report.client_to_broker.map_or(0, |s| s.bytes),
            received_pdus = report.broker_to_client.map_or(0, |s| s.pdus),
            received_bytes = report.broker_to_client.map_or(0, |s| s.bytes),
            duration_ms = report.duration.as_millis() as u64,
            cause = %report.cause,
            "session closed"
        );

        Ok(report)
    }

    async fn open_recorder(&self, peer: &SocketAddr) -> Option<TraceRecorder> {
        let trace = &self.config.trace;
        if !trace.enabled {
            return None;
        }

        match TraceRecorder::create(&trace.directory, peer).await {
            Ok(recorder) => {
                lifecycle!(self.config.verbose, path = %recorder.path().display(), "tracing session");
                Some(recorder)
            }
            Err(e) => {
                warn!(directory = %trace.directory.display(), error = %e, "failed to open trace file, continuing without it");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sink_error("trace");
                }
                None
            }
        }
    }

    fn pipeline(
        &self,
        direction: Direction,
        cancel: &CancellationToken,
        recorder: Option<&TraceRecorder>,
    ) -> RelayPipeline {
        let mut sinks: Vec<Box<dyn PduSink>> = Vec::new();
        if self.config.console.enabled {
            sinks.push(Box::new(ConsoleSink::stdout()));
        }

        let records = match direction {
            Direction::ClientToBroker => self.config.trace.records_client_to_broker(),
            Direction::BrokerToClient => self.config.trace.records_broker_to_client(),
        };
        if let Some(recorder) = recorder.filter(|_| records) {
            sinks.push(Box::new(recorder.clone()));
        }

        let mut pipeline = RelayPipeline::new(direction)
            .with_sinks(sinks)
            .with_codec(MqttCodec::with_max_pdu_size(
                self.config.limits.max_pdu_size,
            ))
            .with_cancellation(cancel.clone())
            .verbose(self.config.verbose);
        if let Some(metrics) = &self.metrics {
            pipeline = pipeline.with_metrics(Arc::clone(metrics));
        }
        pipeline
    }
}

fn flatten(
    joined: std::result::Result<Result<RelayStats>, tokio::task::JoinError>,
) -> Result<RelayStats> {
    joined.map_err(|e| ProxyError::PipelineAborted(e.to_string()))?
}

/// Join a cancelled pipeline, aborting it if its current write does not
/// finish within `grace`.
async fn join_within(
    mut handle: JoinHandle<Result<RelayStats>>,
    grace: Duration,
) -> Result<RelayStats> {
    if let Ok(joined) = tokio::time::timeout(grace, &mut handle).await {
        return flatten(joined);
    }

    warn!(grace_ms = grace.as_millis() as u64, "relay write stalled, aborting");
    handle.abort();
    match handle.await {
        Err(e) if e.is_cancelled() => Err(ProxyError::PipelineAborted(format!(
            "write still pending {}ms after teardown",
            grace.as_millis()
        ))),
        joined => flatten(joined),
    }
}

fn teardown_cause(
    shutdown: bool,
    upstream: &Result<RelayStats>,
    downstream: &Result<RelayStats>,
) -> TeardownCause {
    if shutdown {
        return TeardownCause::Shutdown;
    }

    let results = [
        (Direction::ClientToBroker, upstream),
        (Direction::BrokerToClient, downstream),
    ];
    // A pipeline aborted during teardown is a consequence, not the cause
    let failed = |r: &Result<RelayStats>| {
        matches!(r, Err(e) if !matches!(e, ProxyError::PipelineAborted(_)))
    };
    if let Some((direction, Err(e))) = results.iter().find(|(_, r)| failed(*r)) {
        return TeardownCause::Error {
            direction: *direction,
            kind: e.kind(),
        };
    }

    if let Some((direction, _)) = results
        .iter()
        .find(|(_, r)| matches!(r, Ok(stats) if stats.end == RelayEnd::EndOfStream))
    {
        return TeardownCause::EndOfStream(*direction);
    }

    if let Some((direction, Err(e))) = results.iter().find(|(_, r)| r.is_err()) {
        return TeardownCause::Error {
            direction: *direction,
            kind: e.kind(),
        };
    }

    TeardownCause::EndOfStream(Direction::ClientToBroker)
}
