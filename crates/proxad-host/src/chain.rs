//! Chain execution: an ordered fold of the loaded filters over a running
//! value, with panic isolation per hook call.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use proxad_core::filter::{FilterOutput, HttpFilterOutput};
use proxad_core::{CloseCause, Flow, HttpFlow, HttpReq, HttpResp};
use tracing::error;

use crate::module::FilterModule;

/// Snapshot of the filter chain at one dispatch point. Holding the
/// snapshot pins the module code: a reload swaps the host's slots but
/// calls already running keep their `Arc`s.
pub struct FilterChain {
    pub(crate) modules: Vec<Arc<FilterModule>>,
    pub(crate) skip_on_error: bool,
    pub(crate) print_on_error: bool,
}

/// Final disposition of a chunk after the whole chain ran.
#[derive(Debug, PartialEq)]
pub enum ChainOutcome {
    Forward(Bytes),
    Kill,
}

/// Final disposition of an open hook or an HTTP pair.
#[derive(Debug, PartialEq, Eq)]
pub enum ChainVerdict {
    Continue,
    Kill,
}

enum Direction {
    ClientToServer,
    ServerToClient,
}

impl FilterChain {
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run one hook under `catch_unwind`. `Err` means the hook panicked and
    /// the caller should apply the skip policy.
    fn guarded<T>(
        &self,
        module: &FilterModule,
        hook: &'static str,
        flow_id: impl std::fmt::Display,
        call: impl FnOnce() -> T,
    ) -> Result<T, ()> {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(value) => Ok(value),
            Err(payload) => {
                if self.print_on_error {
                    error!(
                        module = module.name(),
                        hook,
                        flow = %flow_id,
                        panic = %panic_message(&payload),
                        "filter hook panicked"
                    );
                }
                Err(())
            }
        }
    }

    fn raw_direction(&self, flow: &mut Flow, chunk: Bytes, direction: Direction) -> ChainOutcome {
        let flow_id = flow.id();
        let mut value = chunk;
        for module in &self.modules {
            let result = match direction {
                Direction::ClientToServer => {
                    self.guarded(module, "client_raw", flow_id, || {
                        module.filter().client_raw(flow, &value)
                    })
                }
                Direction::ServerToClient => {
                    self.guarded(module, "server_raw", flow_id, || {
                        module.filter().server_raw(flow, &value)
                    })
                }
            };
            match result {
                Ok(FilterOutput::Passthrough) => {}
                Ok(FilterOutput::Replace(replacement)) => value = replacement,
                Ok(FilterOutput::Kill) => return ChainOutcome::Kill,
                // Panicked: skip this filter, or stop the chain while still
                // forwarding whatever value it had accumulated.
                Err(()) if self.skip_on_error => {}
                Err(()) => break,
            }
        }
        ChainOutcome::Forward(value)
    }

    /// Client→server chunk, already recorded in the flow history.
    pub fn client_raw(&self, flow: &mut Flow, chunk: Bytes) -> ChainOutcome {
        self.raw_direction(flow, chunk, Direction::ClientToServer)
    }

    /// Server→client chunk, already recorded in the flow history.
    pub fn server_raw(&self, flow: &mut Flow, chunk: Bytes) -> ChainOutcome {
        self.raw_direction(flow, chunk, Direction::ServerToClient)
    }

    pub fn raw_open(&self, flow: &mut Flow) -> ChainVerdict {
        let flow_id = flow.id();
        for module in &self.modules {
            match self.guarded(module, "raw_open", flow_id, || {
                module.filter().raw_open(flow)
            }) {
                Ok(FilterOutput::Kill) => return ChainVerdict::Kill,
                Ok(_) => {}
                Err(()) if self.skip_on_error => {}
                Err(()) => break,
            }
        }
        ChainVerdict::Continue
    }

    pub fn raw_close(&self, flow: &mut Flow, cause: CloseCause) {
        let flow_id = flow.id();
        for module in &self.modules {
            let _ = self.guarded(module, "raw_close", flow_id, || {
                module.filter().raw_close(flow, cause);
            });
        }
    }

    pub fn http_open(&self, flow: &mut HttpFlow) -> ChainVerdict {
        let flow_id = flow.flow.id();
        for module in &self.modules {
            match self.guarded(module, "http_open", flow_id, || {
                module.filter().http_open(flow)
            }) {
                Ok(FilterOutput::Kill) => return ChainVerdict::Kill,
                Ok(_) => {}
                Err(()) if self.skip_on_error => {}
                Err(()) => break,
            }
        }
        ChainVerdict::Continue
    }

    /// Run the pair through every filter; `resp` ends up holding the final
    /// response on `Continue`.
    pub fn http(&self, flow: &mut HttpFlow, req: &HttpReq, resp: &mut HttpResp) -> ChainVerdict {
        let flow_id = flow.flow.id();
        for module in &self.modules {
            match self.guarded(module, "http", flow_id, || {
                module.filter().http(flow, req, resp)
            }) {
                Ok(HttpFilterOutput::Passthrough) => {}
                Ok(HttpFilterOutput::Replace(replacement)) => *resp = replacement,
                Ok(HttpFilterOutput::Kill) => return ChainVerdict::Kill,
                Err(()) if self.skip_on_error => {}
                Err(()) => break,
            }
        }
        ChainVerdict::Continue
    }

    pub fn http_close(&self, flow: &mut HttpFlow, cause: CloseCause) {
        let flow_id = flow.flow.id();
        for module in &self.modules {
            let _ = self.guarded(module, "http_close", flow_id, || {
                module.filter().http_close(flow, cause);
            });
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
