pub mod interface;

/// Backend providers. The raster provider is always available; the dynamic
/// module loader is feature-gated on `backend_dylib`.
pub mod backends {
    #[cfg(feature = "backend_dylib")]
    pub mod dylib;
    pub mod raster;
    pub mod sandbox;
}

pub use interface::*;
