//! Filter plugin contract.
//!
//! A filter module is a `cdylib` linking this crate, implementing [`Filter`]
//! and exporting its constructor with [`declare_filter!`]:
//!
//! ```ignore
//! use proxad_core::{declare_filter, Filter, FilterOutput, Flow};
//!
//! #[derive(Default)]
//! struct Upper;
//!
//! impl Filter for Upper {
//!     fn state_name(&self) -> &str { "upper" }
//!     fn server_raw(&self, _flow: &mut Flow, chunk: &bytes::Bytes) -> FilterOutput {
//!         FilterOutput::Replace(chunk.to_ascii_uppercase().into())
//!     }
//! }
//!
//! declare_filter!(Upper::default());
//! ```
//!
//! Every hook has a default body, so a module implements only the hooks it
//! cares about; a missing hook behaves as identity. Hooks must not block:
//! they run on the flow's hot path under its lock.

use std::sync::Arc;

use bytes::Bytes;

use crate::flow::{CloseCause, Flow, HttpFlow};
use crate::http::{HttpReq, HttpResp};
use crate::value::StateContainer;

/// Bumped whenever [`Filter`] or the types it exchanges change shape. The
/// host refuses modules built against a different version.
pub const FILTER_ABI_VERSION: u32 = 1;

/// Symbol exported by [`declare_filter!`] that builds the module's filter.
pub const FILTER_ENTRYPOINT: &[u8] = b"proxad_filter_create";

/// Symbol exported by [`declare_filter!`] carrying [`FILTER_ABI_VERSION`].
pub const FILTER_ABI_SYMBOL: &[u8] = b"PROXAD_FILTER_ABI";

/// Signature of the exported constructor.
pub type FilterConstructor = fn() -> Box<dyn Filter>;

/// What a raw-mode hook decided about the chunk it was shown.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutput {
    /// Forward the input unchanged.
    Passthrough,
    /// Forward this instead.
    Replace(Bytes),
    /// Close both sides now; nothing further is forwarded in either
    /// direction and no later chunk of this flow reaches any filter.
    Kill,
}

/// What an HTTP hook decided about the request/response pair.
#[derive(Debug)]
pub enum HttpFilterOutput {
    /// Forward the response object as it stands (in-place mutations
    /// included).
    Passthrough,
    /// Forward this response instead.
    Replace(HttpResp),
    /// Close the flow; the client receives nothing for this pair.
    Kill,
}

/// A traffic filter. One instance per loaded module, shared by every live
/// flow; hooks take `&self` and must be internally synchronized (the
/// per-flow lock only protects the flow, not the filter).
pub trait Filter: Send + Sync {
    /// Name of the persistent state container this module binds to.
    /// Containers are keyed by this name in the host registry, so a
    /// reloaded module picks its old state back up.
    fn state_name(&self) -> &str;

    /// Called once per (re)load, before any traffic hook, with the
    /// container registered under [`Filter::state_name`].
    fn attach_state(&mut self, state: Arc<StateContainer>) {
        let _ = state;
    }

    /// Raw mode: a flow finished its opening sequence. Kill closes it
    /// before any byte moves; Replace is meaningless here and is treated
    /// as Passthrough.
    fn raw_open(&self, flow: &mut Flow) -> FilterOutput {
        let _ = flow;
        FilterOutput::Passthrough
    }

    /// Raw mode: a chunk arrived from the client, already appended to
    /// `flow.client_history()`.
    fn client_raw(&self, flow: &mut Flow, chunk: &Bytes) -> FilterOutput {
        let _ = (flow, chunk);
        FilterOutput::Passthrough
    }

    /// Raw mode: a chunk arrived from the upstream, already appended to
    /// `flow.server_history()`.
    fn server_raw(&self, flow: &mut Flow, chunk: &Bytes) -> FilterOutput {
        let _ = (flow, chunk);
        FilterOutput::Passthrough
    }

    /// Raw mode: the flow reached its terminal state. Invoked exactly once.
    fn raw_close(&self, flow: &mut Flow, cause: CloseCause) {
        let _ = (flow, cause);
    }

    /// HTTP mode: a flow finished its opening sequence.
    fn http_open(&self, flow: &mut HttpFlow) -> FilterOutput {
        let _ = flow;
        FilterOutput::Passthrough
    }

    /// HTTP mode: a request and its response are both fully parsed.
    /// Invoked exactly once per pair, in pipeline order.
    fn http(&self, flow: &mut HttpFlow, req: &HttpReq, resp: &mut HttpResp) -> HttpFilterOutput {
        let _ = (flow, req, resp);
        HttpFilterOutput::Passthrough
    }

    /// HTTP mode: the flow reached its terminal state. Invoked exactly once.
    fn http_close(&self, flow: &mut HttpFlow, cause: CloseCause) {
        let _ = (flow, cause);
    }
}

/// Export `$ctor` as this module's filter constructor, together with the ABI
/// version marker the host checks before calling it.
#[macro_export]
macro_rules! declare_filter {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        pub extern "Rust" fn proxad_filter_create() -> Box<dyn $crate::filter::Filter> {
            Box::new($ctor)
        }

        #[unsafe(no_mangle)]
        pub static PROXAD_FILTER_ABI: u32 = $crate::filter::FILTER_ABI_VERSION;
    };
}
