//! TCP listener for accepting MQTT client connections.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to a [`SessionCoordinator`] that proxies it to the upstream
//! broker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;

use super::session::SessionCoordinator;

/// TCP listener that accepts client connections.
pub struct ProxyListener {
    config: Arc<ProxyConfig>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    active_sessions: Arc<AtomicUsize>,
    next_session_id: AtomicU64,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ProxyListener {
    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen.address).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config: Arc::new(config),
            listener,
            shutdown_tx,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            next_session_id: AtomicU64::new(1),
            metrics: None,
        })
    }

    /// Record session and traffic metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The bound address (useful when configured with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a shutdown handle to signal the listener and its sessions to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Run the listener, accepting connections until shutdown.
    ///
    /// Accept failures are logged and do not stop the loop.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` once shutdown is signalled.
    #[instrument(skip(self), fields(address = %self.config.listen.address))]
    pub async fn run(&self) -> Result<()> {
        info!(
            address = %self.config.listen.address,
            upstream = %self.config.upstream.address,
            "proxy listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => self.spawn_session(socket, peer),
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let active = self.active_sessions();
        if active > 0 {
            info!(active, "sessions still closing");
        }

        Ok(())
    }

    fn spawn_session(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let active = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(peer = %peer, session = session_id, active, "accepted connection");

        let mut coordinator = SessionCoordinator::new(
            Arc::clone(&self.config),
            self.shutdown_tx.subscribe(),
            session_id,
        );
        if let Some(metrics) = &self.metrics {
            metrics.session_opened();
            coordinator = coordinator.with_metrics(Arc::clone(metrics));
        }
        let metrics = self.metrics.clone();
        let active_sessions = Arc::clone(&self.active_sessions);

        tokio::spawn(async move {
            match coordinator.handle(socket, peer).await {
                Ok(report) => {
                    debug!(
                        peer = %peer,
                        session = report.session_id,
                        cause = %report.cause,
                        "session finished"
                    );
                }
                Err(e @ ProxyError::UpstreamConnect { .. }) => {
                    warn!(peer = %peer, session = session_id, error = %e, "session rejected");
                }
                Err(e) => {
                    error!(peer = %peer, session = session_id, error = %e, "session error");
                }
            }
            active_sessions.fetch_sub(1, Ordering::Relaxed);
            if let Some(metrics) = metrics {
                metrics.session_closed();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn test_config(upstream: &str) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listen.address = "127.0.0.1:0".to_string();
        config.upstream.address = upstream.to_string();
        config.console.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_listener_binds_ephemeral_port() {
        let listener = ProxyListener::bind(test_config("127.0.0.1:1883"))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_listener_bind_failure() {
        let taken = ProxyListener::bind(test_config("127.0.0.1:1883"))
            .await
            .unwrap();
        let mut config = test_config("127.0.0.1:1883");
        config.listen.address = taken.local_addr().unwrap().to_string();

        let result = ProxyListener::bind(config).await;
        assert!(matches!(result, Err(ProxyError::Connection(_))));
    }

    #[tokio::test]
    async fn test_listener_proxies_connection() {
        let broker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = broker.local_addr().unwrap().to_string();
        let metrics = Arc::new(ProxyMetrics::new());
        let listener = ProxyListener::bind(test_config(&upstream))
            .await
            .unwrap()
            .with_metrics(Arc::clone(&metrics));
        let addr = listener.local_addr().unwrap();
        let shutdown_handle = listener.shutdown_handle();

        let listener_task = tokio::spawn(async move { listener.run().await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut upstream_conn, _) = broker.accept().await.unwrap();

        client.write_all(&[0xC0, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        upstream_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00]);
        assert_eq!(metrics.sessions_total.get(), 1);

        let _ = shutdown_handle.send(());
        let result = timeout(Duration::from_secs(1), listener_task).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listener_shutdown() {
        let listener = ProxyListener::bind(test_config("127.0.0.1:1883"))
            .await
            .unwrap();
        let shutdown_handle = listener.shutdown_handle();

        let listener_task = tokio::spawn(async move { listener.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_handle.send(());

        let result = timeout(Duration::from_secs(1), listener_task).await;
        assert!(result.is_ok());
    }
}
