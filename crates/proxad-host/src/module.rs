//! Loading and identity of a single filter module.
//!
//! Modules are `cdylib`s exporting the `proxad_filter_create` constructor
//! and the ABI version marker (see `proxad_core::filter`). The on-disk file
//! is shadow-copied into a private directory before `dlopen`: the dynamic
//! loader caches images per path, and operators overwrite the module file
//! in place — loading the copy guarantees a changed file yields fresh code.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use libloading::Library;
use proxad_core::Filter;
use proxad_core::filter::{
    FILTER_ABI_SYMBOL, FILTER_ABI_VERSION, FILTER_ENTRYPOINT, FilterConstructor,
};

use crate::error::HostError;

/// Content identity of a module file, used to decide whether a reload is
/// due. `mtime`/`len` are the cheap first-pass check, `hash` the deciding
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: Option<SystemTime>,
    pub len: u64,
    pub hash: u64,
}

pub(crate) fn content_hash(contents: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(contents);
    hasher.finish()
}

/// Read the file and compute its fingerprint, returning the contents as
/// well so loading does not read twice.
pub(crate) fn fingerprint(path: &Path) -> std::io::Result<(Fingerprint, Vec<u8>)> {
    let contents = std::fs::read(path)?;
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let fp = Fingerprint {
        mtime,
        len: contents.len() as u64,
        hash: content_hash(&contents),
    };
    Ok((fp, contents))
}

/// Stat-then-hash change probe: `None` when the file still matches `known`.
pub(crate) fn probe(path: &Path, known: &Fingerprint) -> std::io::Result<Option<Fingerprint>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() == known.len && meta.modified().ok() == known.mtime {
        return Ok(None);
    }
    let (fp, _) = fingerprint(path)?;
    Ok((fp.hash != known.hash).then_some(fp))
}

/// Where a chain entry came from.
enum ModuleOrigin {
    /// Registered in-process; exempt from watching.
    Builtin,
    /// Loaded from a dylib. The library handle must outlive `filter`
    /// (declaration order in [`FilterModule`] guarantees the drop order).
    Loaded {
        path: PathBuf,
        fingerprint: Fingerprint,
        _library: Library,
    },
}

/// A constructed filter together with whatever keeps its code alive.
/// Snapshots of the chain hold `Arc<FilterModule>`, so a replaced module
/// is unloaded only after the last in-flight call drops its snapshot.
pub struct FilterModule {
    name: String,
    filter: Box<dyn Filter>,
    origin: ModuleOrigin,
}

impl FilterModule {
    pub(crate) fn builtin(filter: Box<dyn Filter>) -> Self {
        Self {
            name: filter.state_name().to_owned(),
            filter,
            origin: ModuleOrigin::Builtin,
        }
    }

    /// Name of the module's state container; doubles as its log identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &dyn Filter {
        self.filter.as_ref()
    }

    pub(crate) fn attach(&mut self, state: std::sync::Arc<proxad_core::StateContainer>) {
        self.filter.attach_state(state);
    }

    pub(crate) fn source_path(&self) -> Option<&Path> {
        match &self.origin {
            ModuleOrigin::Builtin => None,
            ModuleOrigin::Loaded { path, .. } => Some(path),
        }
    }

    pub(crate) fn fingerprint(&self) -> Option<Fingerprint> {
        match &self.origin {
            ModuleOrigin::Builtin => None,
            ModuleOrigin::Loaded { fingerprint, .. } => Some(*fingerprint),
        }
    }
}

impl std::fmt::Debug for FilterModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterModule")
            .field("name", &self.name)
            .field("path", &self.source_path())
            .finish()
    }
}

/// Load the module at `path` through a shadow copy under `shadow_path`.
/// The constructed filter has not had its state attached yet.
pub(crate) fn load(path: &Path, shadow_path: &Path) -> Result<FilterModule, HostError> {
    let (fingerprint, contents) = crate::module::fingerprint(path).map_err(|source| {
        HostError::Read {
            path: path.to_owned(),
            source,
        }
    })?;

    std::fs::write(shadow_path, &contents).map_err(|source| HostError::Read {
        path: shadow_path.to_owned(),
        source,
    })?;

    let library = unsafe { Library::new(shadow_path) }.map_err(|source| HostError::Load {
        path: path.to_owned(),
        source,
    })?;

    let abi = unsafe {
        library
            .get::<*const u32>(FILTER_ABI_SYMBOL)
            .map(|symbol| **symbol)
    }
    .map_err(|source| HostError::Load {
        path: path.to_owned(),
        source,
    })?;
    if abi != FILTER_ABI_VERSION {
        return Err(HostError::AbiMismatch {
            path: path.to_owned(),
            found: abi,
            expected: FILTER_ABI_VERSION,
        });
    }

    let constructor = unsafe { library.get::<FilterConstructor>(FILTER_ENTRYPOINT) }.map_err(
        |source| HostError::Load {
            path: path.to_owned(),
            source,
        },
    )?;

    let filter =
        catch_unwind(AssertUnwindSafe(|| constructor())).map_err(|payload| HostError::Init {
            path: path.to_owned(),
            message: crate::chain::panic_message(&payload),
        })?;

    Ok(FilterModule {
        name: filter.state_name().to_owned(),
        filter,
        origin: ModuleOrigin::Loaded {
            path: path.to_owned(),
            fingerprint,
            _library: library,
        },
    })
}
