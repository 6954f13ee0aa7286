//! Lock-free live registry.
//!
//! [`LiveRegistry`] wraps [`arc_swap::ArcSwap`] so a refresh can replace the
//! whole function table without blocking sessions that are reading it.
//! Sessions take one snapshot when they start and use it until they finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{RegistrationError, Registry};

/// A live, atomically swappable registry.
///
/// ```
/// use codecall_registry::{LiveRegistry, Registry};
/// let live = LiveRegistry::new(Registry::empty());
/// assert!(live.current().is_empty());
/// ```
#[derive(Clone)]
pub struct LiveRegistry {
    inner: Arc<ArcSwap<Registry>>,
    root: Option<PathBuf>,
}

impl LiveRegistry {
    /// Wrap an already built registry. [`refresh`](Self::refresh) rescans
    /// the registry's root if it has one.
    pub fn new(registry: Registry) -> Self {
        let root = registry.root().map(Path::to_path_buf);
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
            root,
        }
    }

    /// Build the initial registry from `root`.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self, RegistrationError> {
        Registry::discover(root).map(Self::new)
    }

    /// A snapshot of the current registry. Never blocks.
    pub fn current(&self) -> Arc<Registry> {
        self.inner.load_full()
    }

    /// Replace the registry. Holders of older snapshots are unaffected.
    pub fn update(&self, registry: Registry) {
        self.inner.store(Arc::new(registry));
    }

    /// Rescan the root and swap in the result.
    ///
    /// On failure the current registry keeps serving and the error is
    /// returned. Registries without a root refresh to themselves.
    pub fn refresh(&self) -> Result<Arc<Registry>, RegistrationError> {
        let Some(root) = &self.root else {
            return Ok(self.current());
        };
        let registry = Arc::new(Registry::discover(root)?);
        self.inner.store(registry.clone());
        tracing::info!(
            root = %root.display(),
            functions = registry.len(),
            "function registry refreshed"
        );
        Ok(registry)
    }

    /// The root this registry refreshes from.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}
