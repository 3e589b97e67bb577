//! Binding layer between an object-style 2D canvas API and a native
//! renderer addressed through opaque integer handles.
//!
//! A [`CanvasBroker`] owns the handle registry and the backend provider
//! picked at initialization. From it, clients create [`DrawingSurface`]s,
//! [`Gradient`]s and [`LayerStack`]s; every drawing call is forwarded to
//! the native module as a named entry point over primitives and handles.
//!
//! ```no_run
//! use std::sync::Arc;
//! use advancegg::{backend::backends::raster::RasterBackend, CanvasBroker};
//!
//! # fn main() -> Result<(), advancegg::CanvasError> {
//! let broker = CanvasBroker::new(Arc::new(RasterBackend::new()));
//! let mut surface = broker.create_surface(800, 600)?;
//! surface.set_rgb(0.9, 0.95, 1.0)?;
//! surface.clear()?;
//! surface.draw_circle(125.0, 300.0, 60.0)?;
//! surface.fill()?;
//! surface.save_png("out.png".as_ref())?;
//! surface.dispose();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod blend;
pub mod broker;
pub mod color;
pub mod errors;
pub mod gradient;
pub mod layers;
pub mod registry;
pub mod surface;

pub use backend::interface::{BackendKind, NativeBackend, RgbaImage};
pub use blend::BlendMode;
pub use broker::{BrokerConfig, CanvasBroker};
pub use color::Color;
pub use errors::CanvasError;
pub use gradient::{ColorStop, Gradient};
pub use layers::{Layer, LayerStack};
pub use registry::{HandleRegistry, ManagedId, ResourceKind};
pub use surface::DrawingSurface;
