use std::sync::Arc;

use crate::backend::interface::NativeBackend;
use crate::errors::CanvasError;
use crate::gradient::Gradient;
use crate::layers::LayerStack;
use crate::registry::HandleRegistry;
use crate::surface::{DrawingSurface, DEFAULT_JPEG_QUALITY};

/// Broker-wide settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// JPEG quality used when an encode call does not pass one.
    pub jpeg_quality: u8,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Entry point of the binding layer: owns the handle registry and the
/// backend selected at initialization.
///
/// The backend is chosen exactly once, when the broker is constructed;
/// nothing downstream branches on which provider is active. Teardown is
/// explicit via [`CanvasBroker::shutdown`] — there is no ambient global
/// registry.
pub struct CanvasBroker {
    registry: Arc<HandleRegistry>,
    config: BrokerConfig,
}

impl CanvasBroker {
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self::with_config(backend, BrokerConfig::default())
    }

    pub fn with_config(backend: Arc<dyn NativeBackend>, config: BrokerConfig) -> Self {
        log::debug!("canvas broker initialized with `{}` backend", backend.name());
        Self {
            registry: Arc::new(HandleRegistry::new(backend)),
            config,
        }
    }

    /// The shared registry. Surfaces and stacks keep it alive on their own,
    /// so the broker itself may be dropped before them.
    pub fn registry(&self) -> Arc<HandleRegistry> {
        Arc::clone(&self.registry)
    }

    /// Creates a drawing surface backed by a fresh native context.
    pub fn create_surface(&self, width: u32, height: u32) -> Result<DrawingSurface, CanvasError> {
        DrawingSurface::create(&self.registry, width, height, self.config.jpeg_quality)
    }

    /// Creates a linear gradient along the axis `(x1, y1)` → `(x2, y2)`.
    pub fn create_linear_gradient(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<Gradient, CanvasError> {
        Gradient::create_linear(&self.registry, x1, y1, x2, y2)
    }

    /// Creates an empty layer stack of the given dimensions.
    pub fn create_layer_stack(&self, width: u32, height: u32) -> Result<LayerStack, CanvasError> {
        LayerStack::create(&self.registry, width, height, self.config.jpeg_quality)
    }

    /// Releases every live resource and unloads the backend. Every
    /// subsequent operation on objects from this broker reports
    /// `BackendUnavailable`.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

#[cfg(feature = "backend_dylib")]
impl CanvasBroker {
    /// Loads the native renderer module at `path` under the given provider
    /// strategy. This is the only place a strategy is picked; the returned
    /// broker is identical in behavior either way.
    pub fn load(
        kind: crate::backend::interface::BackendKind,
        path: &std::path::Path,
    ) -> Result<Self, CanvasError> {
        use crate::backend::backends::{dylib::DylibBackend, sandbox::SandboxBackend};
        use crate::backend::interface::BackendKind;

        let module = DylibBackend::load(path)
            .map_err(|e| CanvasError::BackendAllocationFailed(e.to_string()))?;
        let backend: Arc<dyn NativeBackend> = match kind {
            BackendKind::DynamicModule => Arc::new(module),
            BackendKind::SandboxedRuntime => Arc::new(SandboxBackend::spawn(Box::new(module))),
        };
        Ok(Self::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;

    fn broker() -> CanvasBroker {
        CanvasBroker::new(Arc::new(RasterBackend::new()))
    }

    #[test]
    fn creates_all_three_resource_kinds() {
        let broker = broker();
        let surface = broker.create_surface(64, 48).unwrap();
        assert_eq!((surface.width(), surface.height()), (64, 48));

        let gradient = broker.create_linear_gradient(0.0, 0.0, 64.0, 0.0).unwrap();
        assert!(gradient.stops().is_empty());

        let stack = broker.create_layer_stack(64, 48).unwrap();
        assert!(stack.is_empty());

        assert_eq!(broker.registry().live_count(), 3);
    }

    #[test]
    fn shutdown_poisons_live_objects() {
        let broker = broker();
        let mut surface = broker.create_surface(8, 8).unwrap();
        broker.shutdown();
        match surface.clear() {
            Err(CanvasError::BackendUnavailable) => {}
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn surfaces_outlive_a_dropped_broker() {
        let mut surface = {
            let broker = broker();
            broker.create_surface(8, 8).unwrap()
        };
        surface.set_rgb(0.0, 0.0, 0.0).unwrap();
        surface.dispose();
    }
}
