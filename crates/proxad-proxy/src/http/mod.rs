//! HTTP flow engine: parse request/response pairs on a (possibly
//! TLS-terminated) byte stream, run the filter chain on each pair, and
//! re-emit the response.
//!
//! Requests go upstream byte-exact — parsing delimits the message and
//! feeds the filter's view, but the wire bytes (chunked framing and
//! trailers included) are forwarded untouched. Responses are rebuilt from
//! the filter-visible object. Pipelined requests are handled strictly in
//! order: the next request's response phase starts only after the previous
//! pair has been fully forwarded.

pub(crate) mod emit;
pub(crate) mod parse;

use std::sync::Arc;

use bytes::Bytes;
use proxad_core::http::{HttpReq, Version};
use proxad_core::{CloseCause, Flow, FlowState, HttpFlow};
use proxad_host::{ChainVerdict, FilterHost};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::listener::ProgressClock;
use crate::{BoxedStream, SharedFlow, lock};

use self::parse::{MessageReader, RespMessage};

pub(crate) async fn run(
    flow: Flow,
    client: BoxedStream,
    upstream: BoxedStream,
    host: Arc<FilterHost>,
    cancel: CancellationToken,
    progress: Arc<ProgressClock>,
) {
    let flow_id = flow.id();
    let flow: SharedFlow<HttpFlow> = Arc::new(std::sync::Mutex::new(HttpFlow::new(flow)));

    {
        let mut guard = lock(&flow);
        if host.chain().http_open(&mut guard) == ChainVerdict::Kill {
            guard.flow.advance(FlowState::Killed);
            host.chain().http_close(&mut guard, CloseCause::Killed);
            drop(guard);
            cancel.cancel();
            debug!(flow = %flow_id, "flow killed by open hook");
            return;
        }
        guard.flow.advance(FlowState::Open);
    }

    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut requests = MessageReader::new(client_read);
    let mut responses = MessageReader::new(upstream_read);

    let mut cause = CloseCause::Closed;
    loop {
        let req = tokio::select! {
            _ = cancel.cancelled() => break,
            req = requests.read_request() => req,
        };
        let req = match req {
            Ok(Some(req)) => req,
            // Clean EOF at a message boundary: keep-alive ended.
            Ok(None) => break,
            Err(err) if err.is_io() => {
                debug!(flow = %flow_id, %err, "client read failed");
                cause = CloseCause::Errored;
                break;
            }
            Err(err) => {
                warn!(flow = %flow_id, %err, "malformed request");
                respond(&mut client_write, 400, "bad request").await;
                cause = CloseCause::Errored;
                break;
            }
        };
        progress.touch();
        {
            let mut guard = lock(&flow);
            guard.flow.record_client(&req.raw);
            guard.next_request();
        }

        match forward(&mut upstream_write, &req.raw, &cancel).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                warn!(flow = %flow_id, %err, "upstream write failed");
                respond(&mut client_write, 502, "upstream unreachable").await;
                cause = CloseCause::Errored;
                break;
            }
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => break,
            resp = responses.read_response(req.is_head()) => resp,
        };
        let mut resp = match resp {
            Ok(Some(resp)) => resp,
            Ok(None) => {
                warn!(flow = %flow_id, "upstream closed before responding");
                respond(&mut client_write, 502, "upstream closed early").await;
                cause = CloseCause::Errored;
                break;
            }
            Err(err) => {
                warn!(flow = %flow_id, %err, "bad upstream response");
                respond(&mut client_write, 502, "bad upstream response").await;
                cause = CloseCause::Errored;
                break;
            }
        };
        progress.touch();

        let verdict = {
            let mut guard = lock(&flow);
            guard.flow.record_server(&resp.raw);
            host.chain().http(&mut guard, &req, &mut resp.resp)
        };
        match verdict {
            ChainVerdict::Kill => {
                // Nothing further is sent for this pair.
                cause = CloseCause::Killed;
                cancel.cancel();
                break;
            }
            ChainVerdict::Continue => {
                let wire = emit::serialize_response(&resp.resp, req.is_head());
                match forward(&mut client_write, &wire, &cancel).await {
                    Ok(true) => progress.touch(),
                    Ok(false) => break,
                    Err(err) => {
                        debug!(flow = %flow_id, %err, "client write failed");
                        cause = CloseCause::Errored;
                        break;
                    }
                }
            }
        }

        if !persistent(&req, &resp) {
            break;
        }
    }

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;

    {
        let mut guard = lock(&flow);
        guard.flow.advance(match cause {
            CloseCause::Killed => FlowState::Killed,
            _ => FlowState::Closed,
        });
        host.chain().http_close(&mut guard, cause);
    }
    cancel.cancel();
    debug!(flow = %flow_id, %cause, "flow finished");
}

/// Cancellable write+flush; `Ok(false)` means the flow was cancelled
/// mid-write.
async fn forward<W: AsyncWrite + Unpin>(
    wr: &mut W,
    bytes: &Bytes,
    cancel: &CancellationToken,
) -> Result<bool, ProxyError> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        written = async {
            wr.write_all(bytes).await?;
            wr.flush().await?;
            Ok(())
        } => written.map(|()| true),
    }
}

/// Best-effort synthesized error response; the connection closes right
/// after, so failures here are irrelevant.
async fn respond<W: AsyncWrite + Unpin>(wr: &mut W, status: u16, text: &'static str) {
    let wire = emit::serialize_response(&emit::synthesize(status, text), false);
    let _ = wr.write_all(&wire).await;
    let _ = wr.flush().await;
}

/// Whether the connection survives this pair (RFC 7230 §6.3): nobody said
/// `close`, HTTP/1.0 sides said `keep-alive` explicitly, and the response
/// was not delimited by connection close.
fn persistent(req: &HttpReq, resp: &RespMessage) -> bool {
    if resp.until_close {
        return false;
    }
    if req.headers.has_token("connection", "close")
        || resp.resp.headers.has_token("connection", "close")
    {
        return false;
    }
    let req_ok = req.version == Version::V11 || req.headers.has_token("connection", "keep-alive");
    let resp_ok = resp.resp.version == Version::V11
        || resp.resp.headers.has_token("connection", "keep-alive");
    req_ok && resp_ok
}
