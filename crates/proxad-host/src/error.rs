use std::path::PathBuf;

use thiserror::Error;

/// Why a filter module failed to load or reload. A reload failure leaves
/// the previously loaded module active.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("cannot read filter module {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot load filter module {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("filter module {} was built against ABI {found}, host expects {expected}", .path.display())]
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("filter module {} panicked during initialization: {message}", .path.display())]
    Init { path: PathBuf, message: String },
    #[error("cannot prepare module shadow directory: {0}")]
    ShadowDir(std::io::Error),
}
