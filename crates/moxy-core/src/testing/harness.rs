//! Test harness for integration testing of the intercepting proxy.
//!
//! Provides a complete test environment with:
//! - Mock MQTT broker
//! - A running proxy listener pointed at it
//! - Helper methods for connecting clients and inspecting what the broker saw

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{ProxyConfig, TraceDirection};
use crate::metrics::ProxyMetrics;
use crate::network::ProxyListener;
use crate::protocol::MessageType;

use super::mock_broker::{BrokerCall, MockBroker, ResponseGenerator};

/// Test harness for integration testing.
pub struct ProxyTestHarness {
    /// The mock broker
    mock_broker: MockBroker,
    /// The proxy's bound address
    proxy_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    listener_task: Option<JoinHandle<crate::error::Result<()>>>,
    /// Configuration the proxy was started with
    pub config: Arc<ProxyConfig>,
    /// Metrics shared with the proxy
    pub metrics: Arc<ProxyMetrics>,
}

impl ProxyTestHarness {
    /// Create a new test harness with default configuration: console off,
    /// tracing off, upstream pointed at the mock broker.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Get the proxy address clients should connect to.
    #[must_use]
    pub fn proxy_address(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Get the mock broker address.
    #[must_use]
    pub fn broker_address(&self) -> &str {
        self.mock_broker.address()
    }

    /// Get the mock broker.
    #[must_use]
    pub fn broker(&self) -> &MockBroker {
        &self.mock_broker
    }

    /// Open a client connection to the proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy cannot be reached.
    pub async fn connect_client(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.proxy_addr).await
    }

    /// Register a custom response handler for a message type.
    pub async fn register_handler(&self, message_type: MessageType, handler: ResponseGenerator) {
        self.mock_broker
            .register_handler(message_type, handler)
            .await;
    }

    /// Get all recorded broker calls.
    pub async fn get_broker_calls(&self) -> Vec<BrokerCall> {
        self.mock_broker.get_calls().await
    }

    /// Wait for the broker to record at least `count` calls (two second cap).
    pub async fn wait_for_broker_calls(&self, count: usize) -> Vec<BrokerCall> {
        self.mock_broker
            .wait_for_calls(count, Duration::from_secs(2))
            .await
    }

    /// Shutdown the proxy and the mock broker.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.listener_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        self.mock_broker.stop().await;
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    trace_dir: Option<PathBuf>,
    trace_direction: TraceDirection,
    verbose: bool,
    console: bool,
    max_pdu_size: Option<usize>,
    upstream: Option<String>,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_dir: None,
            trace_direction: TraceDirection::default(),
            verbose: false,
            console: false,
            max_pdu_size: None,
            upstream: None,
        }
    }

    /// Enable trace recording into `dir`.
    #[must_use]
    pub fn trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Which direction(s) the recorder captures.
    #[must_use]
    pub fn trace_direction(mut self, direction: TraceDirection) -> Self {
        self.trace_direction = direction;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Print PDUs to stdout.
    #[must_use]
    pub fn console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    /// Set the PDU ceiling.
    #[must_use]
    pub fn max_pdu_size(mut self, size: usize) -> Self {
        self.max_pdu_size = Some(size);
        self
    }

    /// Point the proxy somewhere other than the mock broker.
    #[must_use]
    pub fn upstream(mut self, address: impl Into<String>) -> Self {
        self.upstream = Some(address.into());
        self
    }

    /// Build the test harness.
    pub async fn build(self) -> ProxyTestHarness {
        let mut mock_broker = MockBroker::new("127.0.0.1:0");
        let broker_addr = mock_broker
            .start()
            .await
            .expect("Failed to start mock broker");

        let mut config = ProxyConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config.upstream.address = self.upstream.unwrap_or(broker_addr);
        config.verbose = self.verbose;
        config.console.enabled = self.console;
        if let Some(dir) = self.trace_dir {
            config.trace.enabled = true;
            config.trace.directory = dir;
        }
        config.trace.direction = self.trace_direction;
        if let Some(size) = self.max_pdu_size {
            config.limits.max_pdu_size = size;
        }

        let metrics = Arc::new(ProxyMetrics::new());
        let listener = ProxyListener::bind(config.clone())
            .await
            .expect("Failed to bind proxy listener")
            .with_metrics(Arc::clone(&metrics));
        let proxy_addr = listener
            .local_addr()
            .expect("Failed to read proxy address");
        let shutdown_tx = listener.shutdown_handle();
        let listener_task = tokio::spawn(async move { listener.run().await });

        ProxyTestHarness {
            mock_broker,
            proxy_addr,
            shutdown_tx,
            listener_task: Some(listener_task),
            config: Arc::new(config),
            metrics,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
