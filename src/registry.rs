use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::interface::{BackendError, NativeBackend, RawHandle};
use crate::errors::CanvasError;

/// Client-visible lightweight identity for a native resource. Monotonic and
/// process-local; an id is never reissued, so a stale reference can only
/// ever fail, not alias a newer resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedId(u64);

impl Display for ManagedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// What to ask the backend to construct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceKind {
    Surface { width: u32, height: u32 },
    LinearGradient { x1: f64, y1: f64, x2: f64, y2: f64 },
    LayerStack { width: u32, height: u32 },
}

/// Which destroy entry point releases a resource.
///
/// Separate from [`ResourceKind`], which carries construction arguments and
/// only matters at allocation: adopted handles (layer surfaces, flatten
/// results) were constructed natively, so all the registry must remember
/// about them is how to release them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    Surface,
    Gradient,
    LayerStack,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    handle: RawHandle,
    family: Family,
}

struct RegistryState {
    /// `None` after [`HandleRegistry::shutdown`]; every call then reports
    /// `BackendUnavailable`.
    backend: Option<Arc<dyn NativeBackend>>,
    entries: HashMap<ManagedId, Entry>,
}

/// Bidirectional table from managed identity to native resource id.
///
/// The mutex around the state is the single serialization point between
/// resolution and the forwarded native call: a disposal racing a forwarded
/// operation fails cleanly with `InvalidHandle` instead of reaching the
/// native module with a freed id.
pub struct HandleRegistry {
    state: Mutex<RegistryState>,
    next: AtomicU64,
}

impl HandleRegistry {
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                backend: Some(backend),
                entries: HashMap::new(),
            }),
            next: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ManagedId {
        ManagedId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Asks the backend to construct a resource of `kind` and maps the new
    /// native id to a fresh managed reference.
    pub fn allocate(&self, kind: ResourceKind) -> Result<ManagedId, CanvasError> {
        let mut state = self.state.lock().expect("registry poisoned");
        let backend = state
            .backend
            .as_ref()
            .ok_or(CanvasError::BackendUnavailable)?
            .clone();

        let (result, family) = match kind {
            ResourceKind::Surface { width, height } => {
                (backend.create_context(width, height), Family::Surface)
            }
            ResourceKind::LinearGradient { x1, y1, x2, y2 } => (
                backend.create_linear_gradient(x1, y1, x2, y2),
                Family::Gradient,
            ),
            ResourceKind::LayerStack { width, height } => (
                backend.create_layer_manager(width, height),
                Family::LayerStack,
            ),
        };

        let handle = result.map_err(|e| match e {
            BackendError::Unavailable => CanvasError::BackendUnavailable,
            BackendError::MissingEntryPoint(name) => CanvasError::FeatureUnavailable(name),
            other => CanvasError::BackendAllocationFailed(other.to_string()),
        })?;

        let id = self.next_id();
        state.entries.insert(id, Entry { handle, family });
        Ok(id)
    }

    /// Maps a pre-existing native id (layer surfaces, flatten results) to a
    /// fresh managed reference. This is the internal factory path; the
    /// public constructors always allocate.
    pub(crate) fn adopt(
        &self,
        handle: RawHandle,
        family: Family,
    ) -> Result<ManagedId, CanvasError> {
        let mut state = self.state.lock().expect("registry poisoned");
        if state.backend.is_none() {
            return Err(CanvasError::BackendUnavailable);
        }
        let id = self.next_id();
        state.entries.insert(id, Entry { handle, family });
        Ok(id)
    }

    /// Resolves a managed reference to its native id.
    pub fn resolve(&self, id: ManagedId) -> Result<RawHandle, CanvasError> {
        let state = self.state.lock().expect("registry poisoned");
        if state.backend.is_none() {
            return Err(CanvasError::BackendUnavailable);
        }
        state
            .entries
            .get(&id)
            .map(|e| e.handle)
            .ok_or(CanvasError::InvalidHandle(id))
    }

    /// Resolves `id` and runs one backend call against it while holding the
    /// table lock, so no release can interleave with the forwarded call.
    pub(crate) fn with_handle<T>(
        &self,
        id: ManagedId,
        op: &'static str,
        f: impl FnOnce(&dyn NativeBackend, RawHandle) -> Result<T, BackendError>,
    ) -> Result<T, CanvasError> {
        let state = self.state.lock().expect("registry poisoned");
        let backend = state
            .backend
            .as_ref()
            .ok_or(CanvasError::BackendUnavailable)?;
        let entry = state.entries.get(&id).ok_or(CanvasError::InvalidHandle(id))?;
        f(backend.as_ref(), entry.handle).map_err(|e| CanvasError::from_backend(op, id, e))
    }

    /// Releases the mapping and the native resource. Idempotent by design:
    /// releasing an unknown or already-released reference is a no-op, which
    /// is what lets overlapping owners (a layer stack and a caller holding
    /// the same surface) both run their disposal paths safely.
    pub fn release(&self, id: ManagedId) {
        let mut state = self.state.lock().expect("registry poisoned");
        let Some(entry) = state.entries.remove(&id) else {
            return;
        };
        let Some(backend) = state.backend.as_ref() else {
            return;
        };
        if let Err(e) = destroy(backend.as_ref(), entry) {
            log::warn!("release of {id} reported by backend: {e}");
        }
    }

    /// Whether `id` currently maps to a live native resource.
    pub fn is_live(&self, id: ManagedId) -> bool {
        let state = self.state.lock().expect("registry poisoned");
        state.entries.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().expect("registry poisoned").entries.len()
    }

    /// Releases every remaining resource and unloads the backend. After
    /// this, every operation on the registry reports `BackendUnavailable`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("registry poisoned");
        let Some(backend) = state.backend.take() else {
            return;
        };
        let entries: Vec<(ManagedId, Entry)> = state.entries.drain().collect();
        if !entries.is_empty() {
            log::debug!("registry shutdown releasing {} live resources", entries.len());
        }
        for (id, entry) in entries {
            if let Err(e) = destroy(backend.as_ref(), entry) {
                log::warn!("shutdown release of {id} reported by backend: {e}");
            }
        }
    }
}

fn destroy(backend: &dyn NativeBackend, entry: Entry) -> Result<(), BackendError> {
    match entry.family {
        Family::Surface => backend.destroy_context(entry.handle),
        Family::Gradient => backend.destroy_gradient(entry.handle),
        Family::LayerStack => backend.destroy_layer_manager(entry.handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;

    fn registry() -> HandleRegistry {
        HandleRegistry::new(Arc::new(RasterBackend::new()))
    }

    #[test]
    fn allocate_resolve_release() {
        let reg = registry();
        let id = reg
            .allocate(ResourceKind::Surface {
                width: 8,
                height: 8,
            })
            .unwrap();
        assert!(reg.resolve(id).is_ok());
        assert!(reg.is_live(id));

        reg.release(id);
        assert!(!reg.is_live(id));
        match reg.resolve(id) {
            Err(CanvasError::InvalidHandle(got)) => assert_eq!(got, id),
            other => panic!("expected InvalidHandle, got {other:?}"),
        }
    }

    #[test]
    fn release_is_idempotent() {
        let reg = registry();
        let id = reg
            .allocate(ResourceKind::Surface {
                width: 4,
                height: 4,
            })
            .unwrap();
        reg.release(id);
        reg.release(id); // second release is a no-op
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn ids_are_never_reused() {
        let reg = registry();
        let a = reg
            .allocate(ResourceKind::Surface {
                width: 4,
                height: 4,
            })
            .unwrap();
        reg.release(a);
        let b = reg
            .allocate(ResourceKind::Surface {
                width: 4,
                height: 4,
            })
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_entry_point_is_feature_unavailable() {
        struct Nameless;
        impl crate::backend::interface::NativeBackend for Nameless {
            fn name(&self) -> &str {
                "nameless"
            }
        }

        let reg = HandleRegistry::new(Arc::new(Nameless));
        match reg.allocate(ResourceKind::LayerStack {
            width: 1,
            height: 1,
        }) {
            Err(CanvasError::FeatureUnavailable("createLayerManager")) => {}
            other => panic!("expected FeatureUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_reports_backend_unavailable() {
        let reg = registry();
        let id = reg
            .allocate(ResourceKind::Surface {
                width: 4,
                height: 4,
            })
            .unwrap();
        reg.shutdown();

        match reg.resolve(id) {
            Err(CanvasError::BackendUnavailable) => {}
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
        match reg.allocate(ResourceKind::Surface {
            width: 4,
            height: 4,
        }) {
            Err(CanvasError::BackendUnavailable) => {}
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
        // release after shutdown stays a silent no-op
        reg.release(id);
    }
}
