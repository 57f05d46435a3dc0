//! Listening socket, flow dispatch, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use proxad_core::Flow;
use proxad_host::FilterHost;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::tls::{TlsClientSettings, TlsServerSettings, upstream_server_name};
use crate::{BoxedStream, http, raw};

/// How a listener interprets the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Raw,
    Http,
}

/// Everything a listener needs. TLS on either side is optional and
/// independent: `tls_server` terminates the client connection,
/// `tls_client` initiates TLS towards the upstream.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub listen: SocketAddr,
    pub upstream: String,
    pub mode: EngineMode,
    pub tls_server: Option<TlsServerSettings>,
    pub tls_client: Option<TlsClientSettings>,
    /// Close a flow when neither direction progressed for this long.
    pub idle_timeout: Option<Duration>,
    /// How long in-flight flows get to finish after shutdown starts.
    pub drain_deadline: Duration,
}

impl ListenerSettings {
    pub fn new(listen: SocketAddr, upstream: impl Into<String>, mode: EngineMode) -> Self {
        Self {
            listen,
            upstream: upstream.into(),
            mode,
            tls_server: None,
            tls_client: None,
            idle_timeout: None,
            drain_deadline: Duration::from_secs(10),
        }
    }
}

/// Last-progress clock shared between a flow's tasks and its idle
/// watchdog.
#[derive(Debug)]
pub(crate) struct ProgressClock(Mutex<Instant>);

impl ProgressClock {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    pub(crate) fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// A bound proxy listener. [`Proxy::run`] accepts until the shutdown
/// token fires, then drains.
pub struct Proxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ConnCtx,
    drain_deadline: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Per-connection view of the listener configuration.
#[derive(Clone)]
struct ConnCtx {
    upstream: String,
    mode: EngineMode,
    acceptor: Option<TlsAcceptor>,
    connector: Option<(TlsConnector, ServerName<'static>)>,
    idle_timeout: Option<Duration>,
    host: Arc<FilterHost>,
    flows: CancellationToken,
}

impl Proxy {
    /// Build the TLS machinery and bind the socket. Both are startup-fatal
    /// on failure.
    pub async fn bind(settings: ListenerSettings, host: Arc<FilterHost>) -> Result<Self, ProxyError> {
        let acceptor = settings
            .tls_server
            .as_ref()
            .map(TlsServerSettings::acceptor)
            .transpose()?;
        let connector = match settings.tls_client.as_ref() {
            Some(tls) => Some((tls.connector()?, upstream_server_name(&settings.upstream)?)),
            None => None,
        };
        let listener =
            TcpListener::bind(settings.listen)
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: settings.listen,
                    source,
                })?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: settings.listen,
            source,
        })?;
        info!(
            addr = %local_addr,
            upstream = %settings.upstream,
            mode = ?settings.mode,
            tls_terminate = acceptor.is_some(),
            tls_upstream = connector.is_some(),
            "listening"
        );
        Ok(Self {
            listener,
            local_addr,
            ctx: ConnCtx {
                upstream: settings.upstream,
                mode: settings.mode,
                acceptor,
                connector,
                idle_timeout: settings.idle_timeout,
                host,
                flows: CancellationToken::new(),
            },
            drain_deadline: settings.drain_deadline,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel this to stop accepting and begin the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept until shutdown, then let in-flight flows finish up to the
    /// drain deadline and cancel the rest. Returns once every flow task
    /// has run its close hooks.
    pub async fn run(self) -> Result<(), ProxyError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.tracker.spawn(handle_connection(self.ctx.clone(), stream, peer));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
            }
        }
        drop(self.listener);

        self.tracker.close();
        info!(flows = self.tracker.len(), "shutting down, draining flows");
        if tokio::time::timeout(self.drain_deadline, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "drain deadline passed, cancelling remaining flows"
            );
            self.ctx.flows.cancel();
            if tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
                .await
                .is_err()
            {
                warn!("some flows ignored cancellation");
            }
        }
        info!("shutdown complete");
        Ok(())
    }
}

async fn handle_connection(ctx: ConnCtx, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let client: BoxedStream = match &ctx.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Box::new(tls),
            Err(err) => {
                warn!(%peer, %err, "client tls handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    let upstream_tcp = match TcpStream::connect(&ctx.upstream).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%peer, upstream = %ctx.upstream, %err, "upstream dial failed");
            if ctx.mode == EngineMode::Http {
                let mut client = client;
                let wire = http::emit::serialize_response(
                    &http::emit::synthesize(502, "upstream unreachable"),
                    false,
                );
                let _ = client.write_all(&wire).await;
                let _ = client.shutdown().await;
            }
            return;
        }
    };
    let _ = upstream_tcp.set_nodelay(true);
    let server_endpoint = upstream_tcp
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

    let upstream: BoxedStream = match &ctx.connector {
        Some((connector, name)) => match connector.connect(name.clone(), upstream_tcp).await {
            Ok(tls) => Box::new(tls),
            Err(err) => {
                warn!(%peer, upstream = %ctx.upstream, %err, "upstream tls handshake failed");
                return;
            }
        },
        None => Box::new(upstream_tcp),
    };

    let flow = Flow::new(peer, server_endpoint);
    let cancel = ctx.flows.child_token();
    let progress = Arc::new(ProgressClock::new());
    if let Some(window) = ctx.idle_timeout {
        tokio::spawn(idle_watchdog(
            Arc::clone(&progress),
            window,
            cancel.clone(),
        ));
    }

    debug!(flow = %flow.id(), %peer, upstream = %server_endpoint, "flow accepted");
    match ctx.mode {
        EngineMode::Raw => raw::run(flow, client, upstream, ctx.host, cancel, progress).await,
        EngineMode::Http => http::run(flow, client, upstream, ctx.host, cancel, progress).await,
    }
}

/// Cancels the flow once neither direction has progressed for `window`.
/// The engines cancel the token when the flow ends, which also retires
/// the watchdog.
async fn idle_watchdog(progress: Arc<ProgressClock>, window: Duration, cancel: CancellationToken) {
    loop {
        let idle = progress.idle_for();
        if idle >= window {
            debug!("idle timeout, cancelling flow");
            cancel.cancel();
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(window - idle) => {}
        }
    }
}
