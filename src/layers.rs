use std::sync::Arc;

use crate::blend::BlendMode;
use crate::errors::CanvasError;
use crate::registry::{HandleRegistry, ManagedId, ResourceKind};
use crate::surface::DrawingSurface;

/// One named layer: a backing surface plus the composition parameters used
/// when the stack is flattened.
pub struct Layer {
    name: String,
    surface: DrawingSurface,
    opacity: f64,
    blend: BlendMode,
    visible: bool,
}

impl Layer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn surface(&self) -> &DrawingSurface {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut DrawingSurface {
        &mut self.surface
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend
    }

    pub fn visible(&self) -> bool {
        self.visible
    }
}

/// Named, ordered collection of drawing surfaces composed into one output.
///
/// Z-order is insertion order: the first layer added is the bottom of the
/// stack. Names are unique at every point in time. The stack owns its
/// layers' surfaces; disposing the stack disposes each of them exactly once.
pub struct LayerStack {
    registry: Arc<HandleRegistry>,
    id: ManagedId,
    width: u32,
    height: u32,
    layers: Vec<Layer>,
    jpeg_quality: u8,
    disposed: bool,
}

impl LayerStack {
    pub(crate) fn create(
        registry: &Arc<HandleRegistry>,
        width: u32,
        height: u32,
        jpeg_quality: u8,
    ) -> Result<Self, CanvasError> {
        let id = registry.allocate(ResourceKind::LayerStack { width, height })?;
        Ok(Self {
            registry: Arc::clone(registry),
            id,
            width,
            height,
            layers: Vec::new(),
            jpeg_quality,
            disposed: false,
        })
    }

    pub fn id(&self) -> ManagedId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names bottom-to-top.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    fn live(&self) -> Result<ManagedId, CanvasError> {
        if self.disposed {
            Err(CanvasError::UseAfterDispose(self.id))
        } else {
            Ok(self.id)
        }
    }

    fn layer_index(&self, name: &str) -> Result<usize, CanvasError> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| CanvasError::UnknownLayer(name.to_string()))
    }

    /// Adds a layer at the top of the z-order and returns its backing
    /// surface. Defaults: opacity 1, Normal blend, visible.
    pub fn add_layer(&mut self, name: &str) -> Result<&mut DrawingSurface, CanvasError> {
        let id = self.live()?;
        if self.layers.iter().any(|l| l.name == name) {
            return Err(CanvasError::DuplicateLayerName(name.to_string()));
        }

        let handle = self
            .registry
            .with_handle(id, "addLayer", |b, h| b.add_layer(h, name))?;
        let surface = DrawingSurface::from_native(
            &self.registry,
            handle,
            self.width,
            self.height,
            self.jpeg_quality,
        )?;

        self.layers.push(Layer {
            name: name.to_string(),
            surface,
            opacity: 1.0,
            blend: BlendMode::Normal,
            visible: true,
        });
        Ok(self.layers.last_mut().map(|l| &mut l.surface).expect("just pushed"))
    }

    /// Mutable access to a layer's backing surface for drawing.
    pub fn layer_surface_mut(&mut self, name: &str) -> Result<&mut DrawingSurface, CanvasError> {
        self.live()?;
        let idx = self.layer_index(name)?;
        Ok(&mut self.layers[idx].surface)
    }

    /// Disposes the backing surface and removes the layer from the z-order.
    pub fn remove_layer(&mut self, name: &str) -> Result<(), CanvasError> {
        self.live()?;
        let idx = self.layer_index(name)?;
        let mut layer = self.layers.remove(idx);
        layer.surface.dispose();
        Ok(())
    }

    /// Sets the layer's composition opacity, clamped to `[0, 1]`.
    pub fn set_layer_opacity(&mut self, name: &str, opacity: f64) -> Result<(), CanvasError> {
        let id = self.live()?;
        let idx = self.layer_index(name)?;
        let opacity = opacity.clamp(0.0, 1.0);
        self.registry.with_handle(id, "setLayerOpacity", |b, h| {
            b.set_layer_opacity(h, name, opacity)
        })?;
        self.layers[idx].opacity = opacity;
        Ok(())
    }

    pub fn set_layer_visible(&mut self, name: &str, visible: bool) -> Result<(), CanvasError> {
        let id = self.live()?;
        let idx = self.layer_index(name)?;
        self.registry.with_handle(id, "setLayerVisible", |b, h| {
            b.set_layer_visible(h, name, visible)
        })?;
        self.layers[idx].visible = visible;
        Ok(())
    }

    pub fn set_layer_blend_mode(&mut self, name: &str, mode: BlendMode) -> Result<(), CanvasError> {
        let id = self.live()?;
        let idx = self.layer_index(name)?;
        self.registry.with_handle(id, "setLayerBlendMode", |b, h| {
            b.set_layer_blend_mode(h, name, mode)
        })?;
        self.layers[idx].blend = mode;
        Ok(())
    }

    /// Composites the visible layers back-to-front into a new surface.
    ///
    /// The result is independently owned and not tracked by the stack;
    /// source layers are unchanged.
    pub fn flatten(&self) -> Result<DrawingSurface, CanvasError> {
        let id = self.live()?;
        let handle = self
            .registry
            .with_handle(id, "flattenLayers", |b, h| b.flatten_layers(h))?;
        DrawingSurface::from_native(
            &self.registry,
            handle,
            self.width,
            self.height,
            self.jpeg_quality,
        )
    }

    /// Disposes every contained layer surface, then the stack itself.
    /// Never raises; a layer surface the caller already disposed
    /// independently is skipped with a warning rather than treated as an
    /// error, so teardown always completes.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for layer in &mut self.layers {
            if layer.surface.is_disposed() {
                log::warn!(
                    "layer `{}` surface was already disposed before its stack",
                    layer.name
                );
            } else {
                layer.surface.dispose();
            }
        }
        self.registry.release(self.id);
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;
    use crate::surface::DEFAULT_JPEG_QUALITY;

    fn stack() -> LayerStack {
        let registry = Arc::new(HandleRegistry::new(Arc::new(RasterBackend::new())));
        LayerStack::create(&registry, 16, 16, DEFAULT_JPEG_QUALITY).unwrap()
    }

    #[test]
    fn layer_set_is_adds_minus_removes_in_order() {
        let mut s = stack();
        s.add_layer("bg").unwrap();
        s.add_layer("mid").unwrap();
        s.add_layer("fg").unwrap();
        assert_eq!(s.layer_names(), vec!["bg", "mid", "fg"]);

        s.remove_layer("mid").unwrap();
        assert_eq!(s.layer_names(), vec!["bg", "fg"]);

        // The removed name is free again; the re-add lands on top.
        s.add_layer("mid").unwrap();
        assert_eq!(s.layer_names(), vec!["bg", "fg", "mid"]);
    }

    #[test]
    fn duplicate_and_unknown_names_are_typed_errors() {
        let mut s = stack();
        s.add_layer("only").unwrap();
        match s.add_layer("only") {
            Err(CanvasError::DuplicateLayerName(n)) => assert_eq!(n, "only"),
            other => panic!("expected DuplicateLayerName, got {other:?}"),
        }
        match s.remove_layer("ghost") {
            Err(CanvasError::UnknownLayer(n)) => assert_eq!(n, "ghost"),
            other => panic!("expected UnknownLayer, got {other:?}"),
        }
        match s.set_layer_opacity("ghost", 0.5) {
            Err(CanvasError::UnknownLayer(_)) => {}
            other => panic!("expected UnknownLayer, got {other:?}"),
        }
        match s.set_layer_blend_mode("ghost", BlendMode::Multiply) {
            Err(CanvasError::UnknownLayer(_)) => {}
            other => panic!("expected UnknownLayer, got {other:?}"),
        }
    }

    #[test]
    fn defaults_and_parameter_mutation() {
        let mut s = stack();
        s.add_layer("a").unwrap();
        let layer = s.layer("a").unwrap();
        assert_eq!(layer.opacity(), 1.0);
        assert_eq!(layer.blend_mode(), BlendMode::Normal);
        assert!(layer.visible());

        s.set_layer_opacity("a", 2.5).unwrap(); // clamped
        s.set_layer_visible("a", false).unwrap();
        s.set_layer_blend_mode("a", BlendMode::Screen).unwrap();

        let layer = s.layer("a").unwrap();
        assert_eq!(layer.opacity(), 1.0);
        assert!(!layer.visible());
        assert_eq!(layer.blend_mode(), BlendMode::Screen);
    }

    #[test]
    fn dispose_releases_every_surface_exactly_once() {
        let mut s = stack();
        s.add_layer("a").unwrap();
        s.add_layer("b").unwrap();
        let registry = Arc::clone(&s.registry);
        assert_eq!(registry.live_count(), 3); // stack + two layer surfaces

        s.dispose();
        s.dispose(); // idempotent
        assert_eq!(registry.live_count(), 0);

        match s.add_layer("c") {
            Err(CanvasError::UseAfterDispose(_)) => {}
            other => panic!("expected UseAfterDispose, got {other:?}"),
        }
    }

    #[test]
    fn dispose_tolerates_independently_disposed_layer_surface() {
        let mut s = stack();
        s.add_layer("a").unwrap();
        s.layer_surface_mut("a").unwrap().dispose();
        // Must not raise or double-release.
        s.dispose();
        assert_eq!(s.registry.live_count(), 0);
    }

    #[test]
    fn flatten_result_is_independent() {
        let mut s = stack();
        {
            let a = s.add_layer("a").unwrap();
            a.set_rgb(1.0, 0.0, 0.0).unwrap();
            a.clear().unwrap();
        }
        let mut flat = s.flatten().unwrap();
        assert_eq!(s.layer_names(), vec!["a"]);

        // Drawing on the flattened surface leaves the source layer alone.
        flat.set_rgb(0.0, 1.0, 0.0).unwrap();
        flat.clear().unwrap();
        let src = s.layer("a").unwrap().surface().snapshot().unwrap();
        assert_eq!(src.pixel(0, 0), [255, 0, 0, 255]);

        // And disposing the stack does not touch the flatten result.
        s.dispose();
        assert!(flat.snapshot().is_ok());
        flat.dispose();
    }
}
