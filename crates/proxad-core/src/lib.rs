//! Shared model and plugin contract for the proxad intercepting proxy.
//!
//! Both the proxy engines and out-of-tree filter modules link this crate:
//! it defines the [`Flow`] the engines drive, the HTTP message model, the
//! [`Filter`] trait with its tagged outputs, and the persistent
//! [`StateContainer`] whose identity survives module reloads.

pub mod filter;
pub mod flow;
pub mod http;
pub mod value;

// Re-exported so filter modules resolve `Bytes` against the exact version
// the host was built with.
pub use bytes;

pub use filter::{Filter, FilterOutput, HttpFilterOutput};
pub use flow::{CloseCause, Flow, FlowState, HttpFlow};
pub use http::{HeaderMap, HttpReq, HttpResp, Uri, Version};
pub use value::{StateContainer, Value};
