//! Raw flow engine: shuttle bytes between client and upstream, invoking
//! the filter chain on every chunk.
//!
//! The two directions run as concurrent tasks. Each one is strictly
//! sequential — read, append to history, run the chain, write, flush —
//! so the sender can never outrun the receiver's buffer. The flow object
//! is locked around the append+chain step only, never across I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use proxad_core::{CloseCause, Flow, FlowState};
use proxad_host::{ChainOutcome, ChainVerdict, FilterHost};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;
use crate::listener::ProgressClock;
use crate::{BoxedStream, SharedFlow, lock};

/// Upper bound on one read; a larger burst arrives as multiple chunks,
/// each its own filter invocation, in order.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

enum Direction {
    ClientToServer,
    ServerToClient,
}

pub(crate) async fn run(
    flow: Flow,
    client: BoxedStream,
    upstream: BoxedStream,
    host: Arc<FilterHost>,
    cancel: CancellationToken,
    progress: Arc<ProgressClock>,
) {
    let flow_id = flow.id();
    let flow: SharedFlow<Flow> = Arc::new(std::sync::Mutex::new(flow));

    {
        let mut guard = lock(&flow);
        if host.chain().raw_open(&mut guard) == ChainVerdict::Kill {
            guard.advance(FlowState::Killed);
            host.chain().raw_close(&mut guard, CloseCause::Killed);
            drop(guard);
            cancel.cancel();
            debug!(flow = %flow_id, "flow killed by open hook");
            return;
        }
        guard.advance(FlowState::Open);
    }

    let killed = Arc::new(AtomicBool::new(false));
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let client_to_server = pump(
        Direction::ClientToServer,
        client_read,
        upstream_write,
        &flow,
        &host,
        &cancel,
        &killed,
        &progress,
    );
    let server_to_client = pump(
        Direction::ServerToClient,
        upstream_read,
        client_write,
        &flow,
        &host,
        &cancel,
        &killed,
        &progress,
    );
    let (to_server, to_client) = tokio::join!(client_to_server, server_to_client);

    let cause = if killed.load(Ordering::Relaxed) {
        CloseCause::Killed
    } else if to_server.is_err() || to_client.is_err() {
        CloseCause::Errored
    } else {
        CloseCause::Closed
    };
    if let Err(err) = to_server.and(to_client) {
        debug!(flow = %flow_id, %err, "flow i/o error");
    }

    {
        let mut guard = lock(&flow);
        guard.advance(match cause {
            CloseCause::Killed => FlowState::Killed,
            _ => FlowState::Closed,
        });
        host.chain().raw_close(&mut guard, cause);
    }
    cancel.cancel();
    debug!(flow = %flow_id, %cause, "flow finished");
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    direction: Direction,
    mut rd: ReadHalf<BoxedStream>,
    mut wr: WriteHalf<BoxedStream>,
    flow: &SharedFlow<Flow>,
    host: &FilterHost,
    cancel: &CancellationToken,
    killed: &AtomicBool,
    progress: &ProgressClock,
) -> Result<(), ProxyError> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = wr.shutdown().await;
                return Ok(());
            }
            read = rd.read(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                cancel.cancel();
                let _ = wr.shutdown().await;
                return Err(err.into());
            }
        };
        if n == 0 {
            // EOF: propagate the half-close; the opposite direction keeps
            // draining until it sees its own EOF.
            let _ = wr.shutdown().await;
            let mut guard = lock(flow);
            guard.advance(match direction {
                Direction::ClientToServer => FlowState::HalfClosedClient,
                Direction::ServerToClient => FlowState::HalfClosedServer,
            });
            return Ok(());
        }
        progress.touch();

        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let outcome = {
            let mut guard = lock(flow);
            if guard.state().is_terminal() {
                None
            } else {
                Some(match direction {
                    Direction::ClientToServer => {
                        guard.record_client(&chunk);
                        host.chain().client_raw(&mut guard, chunk)
                    }
                    Direction::ServerToClient => {
                        guard.record_server(&chunk);
                        host.chain().server_raw(&mut guard, chunk)
                    }
                })
            }
        };
        let Some(outcome) = outcome else {
            // Killed elsewhere between our read and the lock.
            let _ = wr.shutdown().await;
            return Ok(());
        };

        match outcome {
            ChainOutcome::Forward(bytes) => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = wr.shutdown().await;
                        return Ok(());
                    }
                    written = async {
                        wr.write_all(&bytes).await?;
                        wr.flush().await
                    } => written,
                };
                if let Err(err) = written {
                    cancel.cancel();
                    return Err(err.into());
                }
                progress.touch();
            }
            ChainOutcome::Kill => {
                killed.store(true, Ordering::Relaxed);
                // Unblocks the opposite direction, which shuts its own
                // writer; together both sides end up half-closed promptly.
                cancel.cancel();
                let _ = wr.shutdown().await;
                return Ok(());
            }
        }
    }
}
