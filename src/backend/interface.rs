use std::path::Path;

use crate::blend::BlendMode;

/// Opaque native-side resource identifier, issued by the backend when a
/// resource is created. Never reused while the resource is live.
pub type RawHandle = u64;

/// Failures reported across the backend boundary. The broker wraps these
/// into [`crate::errors::CanvasError`] together with the operation name and
/// the managed reference involved.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no native module is loaded")]
    Unavailable,

    #[error("entry point `{0}` is not exported by the native module")]
    MissingEntryPoint(&'static str),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("unknown native handle {0}")]
    UnknownHandle(RawHandle),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("native call failed: {0}")]
    Native(String),
}

/// Which provider strategy backs the broker. Selected exactly once at
/// initialization; broker logic never branches on it afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process dynamic module (`dlopen`-style).
    DynamicModule,
    /// Module hosted inside a sandboxed runtime on its own thread.
    SandboxedRuntime,
}

/// Straight-alpha RGBA8 pixel snapshot of a surface.
#[derive(Clone)]
pub struct RgbaImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbaImage {
    pub fn from_raw(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        assert!(
            pixels.len() >= width as usize * height as usize * 4,
            "pixel buffer too small for image dimensions"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Straight-alpha RGBA of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        assert!(x < self.width && y < self.height, "pixel out of bounds");
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }
}

impl std::fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.pixels.len())
            .finish()
    }
}

macro_rules! missing {
    ($name:literal) => {
        Err(BackendError::MissingEntryPoint($name))
    };
}

/// The sole boundary the broker core depends on: named entry points over
/// primitives and opaque integer handles.
///
/// Every method has a default body reporting [`BackendError::MissingEntryPoint`],
/// so a provider that does not export an entry point loads fine and fails the
/// first dependent call instead. Providers override what they actually export;
/// silently swallowing a missing entry point is not an option.
///
/// Calls are synchronous request/response. A provider may move work to its
/// own thread internally (see the sandbox provider) but must not return
/// before the call took effect.
#[allow(unused_variables)]
pub trait NativeBackend: Send + Sync {
    fn name(&self) -> &str;

    // -- context lifecycle ---------------------------------------------------

    fn create_context(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        missing!("createContext")
    }
    fn destroy_context(&self, ctx: RawHandle) -> Result<(), BackendError> {
        missing!("destroyContext")
    }

    // -- paint state ---------------------------------------------------------

    fn set_rgb(&self, ctx: RawHandle, r: f64, g: f64, b: f64) -> Result<(), BackendError> {
        missing!("setRGB")
    }
    fn set_rgba(&self, ctx: RawHandle, r: f64, g: f64, b: f64, a: f64) -> Result<(), BackendError> {
        missing!("setRGBA")
    }
    fn set_hex_color(&self, ctx: RawHandle, hex: &str) -> Result<(), BackendError> {
        missing!("setHexColor")
    }
    fn clear(&self, ctx: RawHandle) -> Result<(), BackendError> {
        missing!("clear")
    }
    fn set_line_width(&self, ctx: RawHandle, width: f64) -> Result<(), BackendError> {
        missing!("setLineWidth")
    }

    // -- path construction ---------------------------------------------------

    fn move_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        missing!("moveTo")
    }
    fn line_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        missing!("lineTo")
    }
    fn curve_to(
        &self,
        ctx: RawHandle,
        c1x: f64,
        c1y: f64,
        c2x: f64,
        c2y: f64,
        x: f64,
        y: f64,
    ) -> Result<(), BackendError> {
        missing!("curveTo")
    }
    fn close_path(&self, ctx: RawHandle) -> Result<(), BackendError> {
        missing!("closePath")
    }
    fn fill(&self, ctx: RawHandle) -> Result<(), BackendError> {
        missing!("fill")
    }
    fn stroke(&self, ctx: RawHandle) -> Result<(), BackendError> {
        missing!("stroke")
    }

    // -- shape sugar ---------------------------------------------------------

    fn draw_rectangle(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<(), BackendError> {
        missing!("drawRectangle")
    }
    fn draw_rounded_rectangle(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        radius: f64,
    ) -> Result<(), BackendError> {
        missing!("drawRoundedRectangle")
    }
    fn draw_circle(&self, ctx: RawHandle, x: f64, y: f64, radius: f64) -> Result<(), BackendError> {
        missing!("drawCircle")
    }
    fn draw_ellipse(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        rx: f64,
        ry: f64,
    ) -> Result<(), BackendError> {
        missing!("drawEllipse")
    }
    fn draw_line(
        &self,
        ctx: RawHandle,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<(), BackendError> {
        missing!("drawLine")
    }
    fn draw_dashed_line(
        &self,
        ctx: RawHandle,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        pattern: &[f64],
    ) -> Result<(), BackendError> {
        missing!("drawDashedLine")
    }

    // -- text ----------------------------------------------------------------

    fn draw_string(&self, ctx: RawHandle, text: &str, x: f64, y: f64) -> Result<(), BackendError> {
        missing!("drawString")
    }
    fn draw_string_anchored(
        &self,
        ctx: RawHandle,
        text: &str,
        x: f64,
        y: f64,
        ax: f64,
        ay: f64,
    ) -> Result<(), BackendError> {
        missing!("drawStringAnchored")
    }
    fn draw_text_on_circle(
        &self,
        ctx: RawHandle,
        text: &str,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Result<(), BackendError> {
        missing!("drawTextOnCircle")
    }
    fn load_font(&self, ctx: RawHandle, path: &str, size: f64) -> Result<(), BackendError> {
        missing!("loadFont")
    }

    // -- gradients -----------------------------------------------------------

    fn create_linear_gradient(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<RawHandle, BackendError> {
        missing!("createLinearGradient")
    }
    fn add_color_stop(
        &self,
        gradient: RawHandle,
        position: f64,
        r: f64,
        g: f64,
        b: f64,
        a: f64,
    ) -> Result<(), BackendError> {
        missing!("addColorStop")
    }
    fn set_fill_style_gradient(
        &self,
        ctx: RawHandle,
        gradient: RawHandle,
    ) -> Result<(), BackendError> {
        missing!("setFillStyleGradient")
    }
    fn destroy_gradient(&self, gradient: RawHandle) -> Result<(), BackendError> {
        missing!("destroyGradient")
    }

    // -- layers --------------------------------------------------------------

    fn create_layer_manager(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        missing!("createLayerManager")
    }
    fn add_layer(&self, manager: RawHandle, name: &str) -> Result<RawHandle, BackendError> {
        missing!("addLayer")
    }
    fn set_layer_opacity(
        &self,
        manager: RawHandle,
        name: &str,
        opacity: f64,
    ) -> Result<(), BackendError> {
        missing!("setLayerOpacity")
    }
    fn set_layer_visible(
        &self,
        manager: RawHandle,
        name: &str,
        visible: bool,
    ) -> Result<(), BackendError> {
        missing!("setLayerVisible")
    }
    fn set_layer_blend_mode(
        &self,
        manager: RawHandle,
        name: &str,
        mode: BlendMode,
    ) -> Result<(), BackendError> {
        missing!("setLayerBlendMode")
    }
    fn flatten_layers(&self, manager: RawHandle) -> Result<RawHandle, BackendError> {
        missing!("flattenLayers")
    }
    fn destroy_layer_manager(&self, manager: RawHandle) -> Result<(), BackendError> {
        missing!("destroyLayerManager")
    }

    // -- encoding ------------------------------------------------------------

    fn save_png(&self, ctx: RawHandle, path: &Path) -> Result<(), BackendError> {
        missing!("savePNG")
    }
    fn save_jpeg(&self, ctx: RawHandle, path: &Path, quality: u8) -> Result<(), BackendError> {
        missing!("saveJPEG")
    }
    fn to_png(&self, ctx: RawHandle) -> Result<Vec<u8>, BackendError> {
        missing!("toPNG")
    }
    fn to_jpeg(&self, ctx: RawHandle, quality: u8) -> Result<Vec<u8>, BackendError> {
        missing!("toJPEG")
    }

    /// RGBA8 readback of the surface, for previews and tests.
    fn snapshot(&self, ctx: RawHandle) -> Result<RgbaImage, BackendError> {
        missing!("snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Provider that exports nothing beyond its name.
    struct BareBackend;

    impl NativeBackend for BareBackend {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[test]
    fn unimplemented_entry_points_report_their_wire_name() {
        let b = BareBackend;
        match b.create_context(10, 10) {
            Err(BackendError::MissingEntryPoint("createContext")) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match b.draw_text_on_circle(1, "hi", 0.0, 0.0, 10.0) {
            Err(BackendError::MissingEntryPoint("drawTextOnCircle")) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rgba_image_pixel_addressing() {
        let mut pixels = vec![0u8; 4 * 4];
        pixels[4..8].copy_from_slice(&[1, 2, 3, 4]);
        let img = RgbaImage::from_raw(pixels, 2, 2);
        assert_eq!(img.pixel(1, 0), [1, 2, 3, 4]);
        assert_eq!(img.pixel(0, 1), [0, 0, 0, 0]);
    }
}
