//! Moxy MQTT Proxy CLI
//!
//! Accepts MQTT clients, dials one upstream broker per client and relays
//! control packets in both directions while dumping them to the console and,
//! optionally, recording them to per-session trace files.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use moxy_core::config::{LoggingConfig, ProxyConfig};
use moxy_core::metrics::ProxyMetrics;
use moxy_core::network::ProxyListener;

/// Transparent intercepting MQTT proxy.
#[derive(Parser)]
#[command(name = "moxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept MQTT clients on (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Upstream broker address (host:port).
    #[arg(long)]
    server: Option<String>,

    /// Verbose session logging (-v for debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Record every session to a trace file.
    #[arg(long)]
    trace: bool,

    /// Directory trace files are written to.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Do not dump PDUs to stdout.
    #[arg(short, long)]
    quiet: bool,

    /// Serve Prometheus metrics.
    #[arg(long)]
    metrics: bool,
}

impl Args {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(listen) = &self.listen {
            config.listen.address = listen.clone();
        }
        if let Some(server) = &self.server {
            config.upstream.address = server.clone();
        }
        if self.verbose > 0 {
            config.verbose = true;
        }
        if self.trace {
            config.trace.enabled = true;
        }
        if let Some(dir) = &self.trace_dir {
            config.trace.directory = dir.clone();
        }
        if self.quiet {
            config.console.enabled = false;
        }
        if self.metrics {
            config.metrics.enabled = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        upstream = %config.upstream.address,
        trace = config.trace.enabled,
        verbose = config.verbose,
        "starting moxy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_proxy(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    // stdout belongs to the console sink
    if config.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(ProxyMetrics::new());

    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let listener = ProxyListener::bind(config).await?.with_metrics(metrics);
    let shutdown_handle = listener.shutdown_handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping proxy");
        let _ = shutdown_handle.send(());
    });

    listener.run().await?;

    info!("proxy shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ProxyMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
