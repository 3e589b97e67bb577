use std::sync::Arc;

use crate::color::Color;
use crate::errors::CanvasError;
use crate::registry::{HandleRegistry, ManagedId, ResourceKind};

/// One gradient stop: position along the gradient axis plus RGBA color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorStop {
    pub position: f64,
    pub color: Color,
}

/// Ordered color-stop list bound to one native gradient resource.
///
/// Surfaces attach to a gradient by reference, not by copy: stops added
/// after an attach are picked up by every attached surface at the next
/// fill. Ordering of stops is enforced by the backend during sampling, not
/// here.
pub struct Gradient {
    registry: Arc<HandleRegistry>,
    id: ManagedId,
    stops: Vec<ColorStop>,
    disposed: bool,
}

impl Gradient {
    pub(crate) fn create_linear(
        registry: &Arc<HandleRegistry>,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<Self, CanvasError> {
        let id = registry.allocate(ResourceKind::LinearGradient { x1, y1, x2, y2 })?;
        Ok(Self {
            registry: Arc::clone(registry),
            id,
            stops: Vec::new(),
            disposed: false,
        })
    }

    pub fn id(&self) -> ManagedId {
        self.id
    }

    /// Stops as added, in call order.
    pub fn stops(&self) -> &[ColorStop] {
        &self.stops
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Appends a stop locally and forwards it to the backend. `position`
    /// outside `[0, 1]` (or NaN) is rejected before the native call.
    pub fn add_color_stop(&mut self, position: f64, color: Color) -> Result<(), CanvasError> {
        if self.disposed {
            return Err(CanvasError::UseAfterDispose(self.id));
        }
        if !(0.0..=1.0).contains(&position) {
            return Err(CanvasError::InvalidStopPosition(position));
        }
        self.registry.with_handle(self.id, "addColorStop", |b, h| {
            b.add_color_stop(h, position, color.r, color.g, color.b, color.a)
        })?;
        self.stops.push(ColorStop { position, color });
        Ok(())
    }

    /// Releases the native gradient. Never raises; idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.registry.release(self.id);
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;

    fn gradient() -> Gradient {
        let registry = Arc::new(HandleRegistry::new(Arc::new(RasterBackend::new())));
        Gradient::create_linear(&registry, 0.0, 0.0, 100.0, 0.0).unwrap()
    }

    #[test]
    fn stops_accumulate_in_call_order() {
        let mut g = gradient();
        g.add_color_stop(0.0, Color::rgb(1.0, 0.0, 0.0)).unwrap();
        g.add_color_stop(1.0, Color::rgb(0.0, 0.0, 1.0)).unwrap();
        g.add_color_stop(0.5, Color::rgb(0.0, 1.0, 0.0)).unwrap();
        let positions: Vec<f64> = g.stops().iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn out_of_range_positions_are_rejected() {
        let mut g = gradient();
        for bad in [-0.1, 1.1, f64::NAN] {
            match g.add_color_stop(bad, Color::BLACK) {
                Err(CanvasError::InvalidStopPosition(_)) => {}
                other => panic!("expected InvalidStopPosition for {bad}, got {other:?}"),
            }
        }
        // Nothing was appended locally either.
        assert!(g.stops().is_empty());
    }

    #[test]
    fn dispose_then_add_fails_typed() {
        let mut g = gradient();
        g.dispose();
        g.dispose();
        match g.add_color_stop(0.5, Color::WHITE) {
            Err(CanvasError::UseAfterDispose(_)) => {}
            other => panic!("expected UseAfterDispose, got {other:?}"),
        }
    }
}
