//! Filter host: loads filter modules, watches their source files for
//! changes, and hands the engines an invocation surface over the current
//! chain.
//!
//! Reloads are atomic. Every chain slot holds an `Arc` to its current
//! module behind a short-held lock; [`FilterHost::chain`] snapshots the
//! `Arc`s, so a swap never disturbs calls already in flight — they finish
//! against the old code, and the old library unloads when the last
//! snapshot drops. A failed reload keeps the previous module active.
//!
//! Persistent state outlives modules: containers live in the host's
//! name-keyed registry, and a module (re)loaded with the same
//! `state_name()` is attached to the same container instance.

pub mod chain;
pub mod error;
pub mod module;
mod watch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use proxad_core::{Filter, StateContainer};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use chain::{ChainOutcome, ChainVerdict, FilterChain};
pub use error::HostError;
pub use module::{FilterModule, Fingerprint};

/// Host-wide policies.
#[derive(Debug, Clone, Copy)]
pub struct HostSettings {
    /// A panicking hook behaves as Passthrough and the chain continues.
    /// When false the chain stops early, still forwarding the current
    /// value.
    pub skip_on_error: bool,
    /// Log a structured trace when a hook panics.
    pub print_on_error: bool,
    /// How often the watcher probes module files for changes.
    pub watch_period: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            skip_on_error: true,
            print_on_error: true,
            watch_period: Duration::from_millis(500),
        }
    }
}

/// One position in the declared chain order. `load` swaps the module,
/// `chain` reads it.
struct Slot {
    current: RwLock<Arc<FilterModule>>,
}

pub struct FilterHost {
    settings: HostSettings,
    slots: RwLock<Vec<Arc<Slot>>>,
    by_path: Mutex<HashMap<PathBuf, Arc<Slot>>>,
    states: Mutex<HashMap<String, Arc<StateContainer>>>,
    shadow_dir: TempDir,
    load_seq: AtomicU64,
}

impl FilterHost {
    pub fn new(settings: HostSettings) -> Result<Self, HostError> {
        let shadow_dir = tempfile::Builder::new()
            .prefix("proxad-modules-")
            .tempdir()
            .map_err(HostError::ShadowDir)?;
        Ok(Self {
            settings,
            slots: RwLock::new(Vec::new()),
            by_path: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            shadow_dir,
            load_seq: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> HostSettings {
        self.settings
    }

    /// The container registered under `name`, created empty on first use.
    /// The same name always yields the same instance for the lifetime of
    /// the host, across any number of module reloads.
    pub fn state(&self, name: &str) -> Arc<StateContainer> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            states
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(StateContainer::new(name))),
        )
    }

    /// Load or reload the module file at `path`. First load appends a
    /// chain slot (declaration order = chain order); a reload swaps the
    /// slot's module atomically. On error the previous module, if any,
    /// stays active.
    pub fn load(&self, path: &Path) -> Result<(), HostError> {
        let seq = self.load_seq.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_owned());
        let shadow_path = self.shadow_dir.path().join(format!("{seq}-{file_name}"));

        let mut loaded = module::load(path, &shadow_path)?;
        self.attach_state(&mut loaded, path)?;
        let loaded = Arc::new(loaded);

        let mut by_path = self.by_path.lock().unwrap_or_else(PoisonError::into_inner);
        match by_path.get(path) {
            Some(slot) => {
                let mut current = slot
                    .current
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                *current = loaded;
            }
            None => {
                let slot = Arc::new(Slot {
                    current: RwLock::new(loaded),
                });
                by_path.insert(path.to_owned(), Arc::clone(&slot));
                self.slots
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(slot);
            }
        }
        info!(path = %path.display(), "filter module loaded");
        Ok(())
    }

    fn attach_state(&self, loaded: &mut FilterModule, path: &Path) -> Result<(), HostError> {
        let container = self.state(loaded.name());
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            loaded.attach(container);
        }))
        .map_err(|payload| HostError::Init {
            path: path.to_owned(),
            message: chain::panic_message(&payload),
        })
    }

    /// Register an in-process filter at the end of the chain. Used by
    /// embedders and tests; such slots are exempt from watching.
    pub fn push_filter(&self, mut filter: Box<dyn Filter>) {
        let container = self.state(filter.state_name());
        filter.attach_state(container);
        let slot = Arc::new(Slot {
            current: RwLock::new(Arc::new(FilterModule::builtin(filter))),
        });
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
    }

    /// Snapshot the current chain for one dispatch. Cheap: clones one
    /// `Arc` per slot.
    pub fn chain(&self) -> FilterChain {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        FilterChain {
            modules: slots
                .iter()
                .map(|slot| {
                    Arc::clone(&slot.current.read().unwrap_or_else(PoisonError::into_inner))
                })
                .collect(),
            skip_on_error: self.settings.skip_on_error,
            print_on_error: self.settings.print_on_error,
        }
    }

    /// Paths and last-seen fingerprints of every dylib-backed slot.
    pub(crate) fn watched(&self) -> Vec<(PathBuf, Fingerprint)> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter_map(|slot| {
                let module = slot.current.read().unwrap_or_else(PoisonError::into_inner);
                Some((module.source_path()?.to_owned(), module.fingerprint()?))
            })
            .collect()
    }

    /// Spawn the change watcher. It probes module files every
    /// `watch_period` and reloads on content change until `cancel` fires.
    pub fn spawn_watcher(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(watch::run(self, cancel))
    }
}

impl std::fmt::Debug for FilterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterHost")
            .field("slots", &self.slots.read().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}
