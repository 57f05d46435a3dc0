//! Proxy engines for proxad: the raw byte pump, the HTTP/1.x
//! interception engine, TLS termination on either side, and the
//! listener that dispatches accepted connections into flows.

mod error;
pub(crate) mod http;
mod listener;
mod raw;
mod tls;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::ProxyError;
pub use listener::{EngineMode, ListenerSettings, Proxy};
pub use tls::{TlsClientSettings, TlsServerSettings};

/// A flow's byte stream once TLS (if any) has been applied. The engines
/// never know what is underneath.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub(crate) type BoxedStream = Box<dyn IoStream>;

/// The flow object, shared between the tasks of one flow. Locked around
/// history append + chain dispatch, never across an await point.
pub(crate) type SharedFlow<T> = Arc<Mutex<T>>;

pub(crate) fn lock<T>(flow: &SharedFlow<T>) -> MutexGuard<'_, T> {
    flow.lock().unwrap_or_else(PoisonError::into_inner)
}
