use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use proxad_host::{FilterHost, HostSettings};
use proxad_proxy::{EngineMode, ListenerSettings, Proxy, TlsClientSettings, TlsServerSettings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "proxad",
    about = "Intercepting TCP/TLS/HTTP reverse proxy for attack-defense CTFs",
    version
)]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    listen: SocketAddr,

    /// Upstream address (host:port)
    #[arg(long)]
    upstream: String,

    /// How to interpret the byte stream
    #[arg(long, value_enum, default_value = "raw")]
    mode: Mode,

    /// Certificate chain for terminating client TLS (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Private key for terminating client TLS (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// CA bundle for verifying the upstream; enables TLS towards it (PEM)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Filter module to load, in chain order (repeatable)
    #[arg(long = "filter")]
    filters: Vec<PathBuf>,

    /// Close flows idle in both directions for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Raw,
    Http,
}

impl From<Mode> for EngineMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Raw => EngineMode::Raw,
            Mode::Http => EngineMode::Http,
        }
    }
}

fn settings_from(cli: &Cli) -> anyhow::Result<ListenerSettings> {
    let mut settings = ListenerSettings::new(cli.listen, cli.upstream.clone(), cli.mode.into());

    settings.tls_server = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert_chain), Some(private_key)) => Some(TlsServerSettings {
            cert_chain: cert_chain.clone(),
            private_key: private_key.clone(),
            alpn: vec![b"http/1.1".to_vec()],
        }),
        (None, None) => None,
        _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
    };
    settings.tls_client = cli.tls_ca.as_ref().map(|ca_bundle| TlsClientSettings {
        ca_bundle: ca_bundle.clone(),
        alpn: vec![b"http/1.1".to_vec()],
    });
    settings.idle_timeout = cli.idle_timeout.map(Duration::from_secs);
    Ok(settings)
}

// Exit codes: 0 normal shutdown, 2 configuration error (clap uses the
// same for usage errors), 1 runtime failure.
const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let settings = match settings_from(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let host = match FilterHost::new(HostSettings::default()) {
        Ok(host) => Arc::new(host),
        Err(err) => {
            error!(%err, "cannot initialize filter host");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };
    for path in &cli.filters {
        if let Err(err) = host.load(path) {
            error!(%err, "cannot load filter module");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let proxy = match Proxy::bind(settings, Arc::clone(&host)).await {
        Ok(proxy) => proxy,
        Err(err) => {
            error!(%err, "startup failed");
            return ExitCode::from(if err.is_config() {
                EXIT_CONFIG
            } else {
                EXIT_RUNTIME
            });
        }
    };

    let shutdown = proxy.shutdown_token();
    let watcher = Arc::clone(&host).spawn_watcher(shutdown.clone());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    let result = proxy.run().await;
    let _ = watcher.await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "proxy failed");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
