//! Sample raw-mode filter.
//!
//! Build as a `cdylib` and load with:
//!   `proxad --listen ... --upstream ... --filter target/release/libpingpong.so`
//!
//! Rewrites `PING` to `PONG` in server→client chunks, and kills any flow
//! whose client ever sent `evilbanana`. Killed flows are tallied in the
//! `evil_flows` counter, which survives module reloads.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use proxad_core::bytes::Bytes;
use proxad_core::{CloseCause, Filter, FilterOutput, Flow, StateContainer, declare_filter};

const EVIL_MARKER: &[u8] = b"evilbanana";

#[derive(Default)]
struct PingPong {
    evil_flows: Option<Arc<AtomicI64>>,
}

impl Filter for PingPong {
    fn state_name(&self) -> &str {
        "pingpong"
    }

    fn attach_state(&mut self, state: Arc<StateContainer>) {
        self.evil_flows = Some(state.counter("evil_flows"));
    }

    fn server_raw(&self, flow: &mut Flow, chunk: &Bytes) -> FilterOutput {
        if contains(flow.client_history(), EVIL_MARKER) {
            if let Some(evil_flows) = &self.evil_flows {
                evil_flows.fetch_add(1, Ordering::Relaxed);
            }
            return FilterOutput::Kill;
        }
        if contains(chunk, b"PING") {
            FilterOutput::Replace(replace(chunk, b"PING", b"PONG").into())
        } else {
            FilterOutput::Passthrough
        }
    }

    fn raw_close(&self, flow: &mut Flow, cause: CloseCause) {
        if cause == CloseCause::Killed {
            flow.user_attrs
                .insert("blocked".into(), proxad_core::Value::Bool(true));
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn replace(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

declare_filter!(PingPong::default());
