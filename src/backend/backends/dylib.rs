//! Dynamic-module provider.
//!
//! Loads the native renderer as a shared library and resolves one C symbol
//! per entry point, lazily at call time. A symbol the module does not
//! export is not a load error; the call that needs it reports
//! [`BackendError::MissingEntryPoint`] with the entry point's wire name.
//!
//! C contract of the module:
//! - constructors (`create_context`, `create_linear_gradient`,
//!   `create_layer_manager`, `add_layer`, `flatten_layers`) return a
//!   nonzero `u64` handle, `0` on allocation failure;
//! - mutators return an `i32` status, `0` for success;
//! - strings cross as NUL-terminated UTF-8, dash patterns as pointer plus
//!   length;
//! - `to_png`/`to_jpeg`/`snapshot_rgba` return a malloc'd buffer the caller
//!   must hand back to `free_buffer`.

use std::ffi::CString;
use std::os::raw::c_char;
use std::path::Path;

use libloading::Library;

use crate::backend::interface::{BackendError, NativeBackend, RawHandle, RgbaImage};
use crate::blend::BlendMode;

type CreateContextFn = unsafe extern "C" fn(u32, u32) -> u64;
type HandleFn = unsafe extern "C" fn(u64) -> i32;
type Handle2Fn = unsafe extern "C" fn(u64, f64, f64) -> i32;
type Handle3Fn = unsafe extern "C" fn(u64, f64, f64, f64) -> i32;
type Handle4Fn = unsafe extern "C" fn(u64, f64, f64, f64, f64) -> i32;
type Handle5Fn = unsafe extern "C" fn(u64, f64, f64, f64, f64, f64) -> i32;
type Handle6Fn = unsafe extern "C" fn(u64, f64, f64, f64, f64, f64, f64) -> i32;
type HandleStrFn = unsafe extern "C" fn(u64, *const c_char) -> i32;
type DashedLineFn = unsafe extern "C" fn(u64, f64, f64, f64, f64, *const f64, usize) -> i32;
type DrawStringFn = unsafe extern "C" fn(u64, *const c_char, f64, f64) -> i32;
type DrawStringAnchoredFn = unsafe extern "C" fn(u64, *const c_char, f64, f64, f64, f64) -> i32;
type TextOnCircleFn = unsafe extern "C" fn(u64, *const c_char, f64, f64, f64) -> i32;
type LoadFontFn = unsafe extern "C" fn(u64, *const c_char, f64) -> i32;
type CreateGradientFn = unsafe extern "C" fn(f64, f64, f64, f64) -> u64;
type AddStopFn = unsafe extern "C" fn(u64, f64, f64, f64, f64, f64) -> i32;
type TwoHandleFn = unsafe extern "C" fn(u64, u64) -> i32;
type CreateManagerFn = unsafe extern "C" fn(u32, u32) -> u64;
type AddLayerFn = unsafe extern "C" fn(u64, *const c_char) -> u64;
type LayerF64Fn = unsafe extern "C" fn(u64, *const c_char, f64) -> i32;
type LayerI32Fn = unsafe extern "C" fn(u64, *const c_char, i32) -> i32;
type FlattenFn = unsafe extern "C" fn(u64) -> u64;
type SaveJpegFn = unsafe extern "C" fn(u64, *const c_char, i32) -> i32;
type EncodeFn = unsafe extern "C" fn(u64, *mut usize) -> *mut u8;
type EncodeQualityFn = unsafe extern "C" fn(u64, i32, *mut usize) -> *mut u8;
type SnapshotFn = unsafe extern "C" fn(u64, *mut u32, *mut u32, *mut usize) -> *mut u8;
type FreeBufferFn = unsafe extern "C" fn(*mut u8, usize);

/// Native renderer module loaded in-process.
pub struct DylibBackend {
    lib: Library,
    name: String,
}

impl DylibBackend {
    /// Loads the module at `path`. Only the load itself can fail here;
    /// entry points are resolved per call.
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        // Soundness: the module must be a well-behaved renderer exporting
        // the C contract above. That is the embedder's promise when
        // pointing the broker at a path.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| BackendError::Allocation(format!("cannot load `{}`: {e}", path.display())))?;
        log::info!("loaded native renderer module `{}`", path.display());
        Ok(Self {
            lib,
            name: format!("dylib({})", path.display()),
        })
    }

    fn sym<T>(
        &self,
        symbol: &'static [u8],
        wire: &'static str,
    ) -> Result<libloading::Symbol<'_, T>, BackendError> {
        unsafe { self.lib.get(symbol) }.map_err(|_| BackendError::MissingEntryPoint(wire))
    }

    fn cstr(text: &str) -> Result<CString, BackendError> {
        CString::new(text).map_err(|_| BackendError::Native("string contains NUL".into()))
    }

    fn cpath(path: &Path) -> Result<CString, BackendError> {
        Self::cstr(&path.to_string_lossy())
    }

    /// Copies a module-owned buffer into a `Vec` and returns it to the
    /// module's allocator.
    fn take_buffer(&self, ptr: *mut u8, len: usize, wire: &'static str) -> Result<Vec<u8>, BackendError> {
        if ptr.is_null() {
            return Err(BackendError::Encode(format!("{wire} returned no buffer")));
        }
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
        let free: libloading::Symbol<'_, FreeBufferFn> = self.sym(b"free_buffer\0", "freeBuffer")?;
        unsafe { free(ptr, len) };
        Ok(bytes)
    }
}

impl std::fmt::Debug for DylibBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DylibBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn ok(status: i32, wire: &'static str) -> Result<(), BackendError> {
    if status == 0 {
        Ok(())
    } else {
        Err(BackendError::Native(format!("{wire} returned status {status}")))
    }
}

fn created(handle: u64, wire: &'static str) -> Result<RawHandle, BackendError> {
    if handle == 0 {
        Err(BackendError::Allocation(format!("{wire} returned a null handle")))
    } else {
        Ok(handle)
    }
}

impl NativeBackend for DylibBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_context(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        let f: libloading::Symbol<'_, CreateContextFn> =
            self.sym(b"create_context\0", "createContext")?;
        created(unsafe { f(width, height) }, "createContext")
    }

    fn destroy_context(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> = self.sym(b"destroy_context\0", "destroyContext")?;
        ok(unsafe { f(ctx) }, "destroyContext")
    }

    fn set_rgb(&self, ctx: RawHandle, r: f64, g: f64, b: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle3Fn> = self.sym(b"set_rgb\0", "setRGB")?;
        ok(unsafe { f(ctx, r, g, b) }, "setRGB")
    }

    fn set_rgba(&self, ctx: RawHandle, r: f64, g: f64, b: f64, a: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle4Fn> = self.sym(b"set_rgba\0", "setRGBA")?;
        ok(unsafe { f(ctx, r, g, b, a) }, "setRGBA")
    }

    fn set_hex_color(&self, ctx: RawHandle, hex: &str) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleStrFn> = self.sym(b"set_hex_color\0", "setHexColor")?;
        let hex = Self::cstr(hex)?;
        ok(unsafe { f(ctx, hex.as_ptr()) }, "setHexColor")
    }

    fn clear(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> = self.sym(b"clear\0", "clear")?;
        ok(unsafe { f(ctx) }, "clear")
    }

    fn set_line_width(&self, ctx: RawHandle, width: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, unsafe extern "C" fn(u64, f64) -> i32> =
            self.sym(b"set_line_width\0", "setLineWidth")?;
        ok(unsafe { f(ctx, width) }, "setLineWidth")
    }

    fn move_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle2Fn> = self.sym(b"move_to\0", "moveTo")?;
        ok(unsafe { f(ctx, x, y) }, "moveTo")
    }

    fn line_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle2Fn> = self.sym(b"line_to\0", "lineTo")?;
        ok(unsafe { f(ctx, x, y) }, "lineTo")
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
        let f: libloading::Symbol<'_, Handle6Fn> = self.sym(b"curve_to\0", "curveTo")?;
        ok(unsafe { f(ctx, c1x, c1y, c2x, c2y, x, y) }, "curveTo")
    }

    fn close_path(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> = self.sym(b"close_path\0", "closePath")?;
        ok(unsafe { f(ctx) }, "closePath")
    }

    fn fill(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> = self.sym(b"fill\0", "fill")?;
        ok(unsafe { f(ctx) }, "fill")
    }

    fn stroke(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> = self.sym(b"stroke\0", "stroke")?;
        ok(unsafe { f(ctx) }, "stroke")
    }

    fn draw_rectangle(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle4Fn> = self.sym(b"draw_rectangle\0", "drawRectangle")?;
        ok(unsafe { f(ctx, x, y, width, height) }, "drawRectangle")
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
        let f: libloading::Symbol<'_, Handle5Fn> =
            self.sym(b"draw_rounded_rectangle\0", "drawRoundedRectangle")?;
        ok(unsafe { f(ctx, x, y, width, height, radius) }, "drawRoundedRectangle")
    }

    fn draw_circle(&self, ctx: RawHandle, x: f64, y: f64, radius: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle3Fn> = self.sym(b"draw_circle\0", "drawCircle")?;
        ok(unsafe { f(ctx, x, y, radius) }, "drawCircle")
    }

    fn draw_ellipse(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        rx: f64,
        ry: f64,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle4Fn> = self.sym(b"draw_ellipse\0", "drawEllipse")?;
        ok(unsafe { f(ctx, x, y, rx, ry) }, "drawEllipse")
    }

    fn draw_line(
        &self,
        ctx: RawHandle,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, Handle4Fn> = self.sym(b"draw_line\0", "drawLine")?;
        ok(unsafe { f(ctx, x1, y1, x2, y2) }, "drawLine")
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
        let f: libloading::Symbol<'_, DashedLineFn> =
            self.sym(b"draw_dashed_line\0", "drawDashedLine")?;
        ok(
            unsafe { f(ctx, x1, y1, x2, y2, pattern.as_ptr(), pattern.len()) },
            "drawDashedLine",
        )
    }

    fn draw_string(&self, ctx: RawHandle, text: &str, x: f64, y: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, DrawStringFn> = self.sym(b"draw_string\0", "drawString")?;
        let text = Self::cstr(text)?;
        ok(unsafe { f(ctx, text.as_ptr(), x, y) }, "drawString")
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
        let f: libloading::Symbol<'_, DrawStringAnchoredFn> =
            self.sym(b"draw_string_anchored\0", "drawStringAnchored")?;
        let text = Self::cstr(text)?;
        ok(unsafe { f(ctx, text.as_ptr(), x, y, ax, ay) }, "drawStringAnchored")
    }

    fn draw_text_on_circle(
        &self,
        ctx: RawHandle,
        text: &str,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, TextOnCircleFn> =
            self.sym(b"draw_text_on_circle\0", "drawTextOnCircle")?;
        let text = Self::cstr(text)?;
        ok(unsafe { f(ctx, text.as_ptr(), x, y, radius) }, "drawTextOnCircle")
    }

    fn load_font(&self, ctx: RawHandle, path: &str, size: f64) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, LoadFontFn> = self.sym(b"load_font_face\0", "loadFont")?;
        let path = Self::cstr(path)?;
        ok(unsafe { f(ctx, path.as_ptr(), size) }, "loadFont")
    }

    fn create_linear_gradient(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<RawHandle, BackendError> {
        let f: libloading::Symbol<'_, CreateGradientFn> =
            self.sym(b"create_linear_gradient\0", "createLinearGradient")?;
        created(unsafe { f(x1, y1, x2, y2) }, "createLinearGradient")
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
        let f: libloading::Symbol<'_, AddStopFn> = self.sym(b"add_color_stop\0", "addColorStop")?;
        ok(unsafe { f(gradient, position, r, g, b, a) }, "addColorStop")
    }

    fn set_fill_style_gradient(
        &self,
        ctx: RawHandle,
        gradient: RawHandle,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, TwoHandleFn> =
            self.sym(b"set_fill_style_gradient\0", "setFillStyleGradient")?;
        ok(unsafe { f(ctx, gradient) }, "setFillStyleGradient")
    }

    fn destroy_gradient(&self, gradient: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> =
            self.sym(b"destroy_gradient\0", "destroyGradient")?;
        ok(unsafe { f(gradient) }, "destroyGradient")
    }

    fn create_layer_manager(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        let f: libloading::Symbol<'_, CreateManagerFn> =
            self.sym(b"create_layer_manager\0", "createLayerManager")?;
        created(unsafe { f(width, height) }, "createLayerManager")
    }

    fn add_layer(&self, manager: RawHandle, name: &str) -> Result<RawHandle, BackendError> {
        let f: libloading::Symbol<'_, AddLayerFn> = self.sym(b"add_layer\0", "addLayer")?;
        let name = Self::cstr(name)?;
        created(unsafe { f(manager, name.as_ptr()) }, "addLayer")
    }

    fn set_layer_opacity(
        &self,
        manager: RawHandle,
        name: &str,
        opacity: f64,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, LayerF64Fn> =
            self.sym(b"set_layer_opacity\0", "setLayerOpacity")?;
        let name = Self::cstr(name)?;
        ok(unsafe { f(manager, name.as_ptr(), opacity) }, "setLayerOpacity")
    }

    fn set_layer_visible(
        &self,
        manager: RawHandle,
        name: &str,
        visible: bool,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, LayerI32Fn> =
            self.sym(b"set_layer_visible\0", "setLayerVisible")?;
        let name = Self::cstr(name)?;
        ok(
            unsafe { f(manager, name.as_ptr(), i32::from(visible)) },
            "setLayerVisible",
        )
    }

    fn set_layer_blend_mode(
        &self,
        manager: RawHandle,
        name: &str,
        mode: BlendMode,
    ) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, LayerI32Fn> =
            self.sym(b"set_layer_blend_mode\0", "setLayerBlendMode")?;
        let name = Self::cstr(name)?;
        ok(
            unsafe { f(manager, name.as_ptr(), mode.tag()) },
            "setLayerBlendMode",
        )
    }

    fn flatten_layers(&self, manager: RawHandle) -> Result<RawHandle, BackendError> {
        let f: libloading::Symbol<'_, FlattenFn> = self.sym(b"flatten_layers\0", "flattenLayers")?;
        created(unsafe { f(manager) }, "flattenLayers")
    }

    fn destroy_layer_manager(&self, manager: RawHandle) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleFn> =
            self.sym(b"destroy_layer_manager\0", "destroyLayerManager")?;
        ok(unsafe { f(manager) }, "destroyLayerManager")
    }

    fn save_png(&self, ctx: RawHandle, path: &Path) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, HandleStrFn> = self.sym(b"save_png\0", "savePNG")?;
        let path = Self::cpath(path)?;
        ok(unsafe { f(ctx, path.as_ptr()) }, "savePNG")
    }

    fn save_jpeg(&self, ctx: RawHandle, path: &Path, quality: u8) -> Result<(), BackendError> {
        let f: libloading::Symbol<'_, SaveJpegFn> = self.sym(b"save_jpeg\0", "saveJPEG")?;
        let path = Self::cpath(path)?;
        ok(unsafe { f(ctx, path.as_ptr(), quality as i32) }, "saveJPEG")
    }

    fn to_png(&self, ctx: RawHandle) -> Result<Vec<u8>, BackendError> {
        let f: libloading::Symbol<'_, EncodeFn> = self.sym(b"to_png\0", "toPNG")?;
        let mut len = 0usize;
        let ptr = unsafe { f(ctx, &mut len) };
        self.take_buffer(ptr, len, "toPNG")
    }

    fn to_jpeg(&self, ctx: RawHandle, quality: u8) -> Result<Vec<u8>, BackendError> {
        let f: libloading::Symbol<'_, EncodeQualityFn> = self.sym(b"to_jpeg\0", "toJPEG")?;
        let mut len = 0usize;
        let ptr = unsafe { f(ctx, quality as i32, &mut len) };
        self.take_buffer(ptr, len, "toJPEG")
    }

    fn snapshot(&self, ctx: RawHandle) -> Result<RgbaImage, BackendError> {
        let f: libloading::Symbol<'_, SnapshotFn> = self.sym(b"snapshot_rgba\0", "snapshot")?;
        let (mut width, mut height, mut len) = (0u32, 0u32, 0usize);
        let ptr = unsafe { f(ctx, &mut width, &mut height, &mut len) };
        let pixels = self.take_buffer(ptr, len, "snapshot")?;
        if pixels.len() < width as usize * height as usize * 4 {
            return Err(BackendError::Native(format!(
                "snapshot buffer of {} bytes is short for {width}x{height}",
                pixels.len()
            )));
        }
        Ok(RgbaImage::from_raw(pixels, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_a_missing_module_fails_as_allocation() {
        match DylibBackend::load(Path::new("/nonexistent/librenderer.so")) {
            Err(BackendError::Allocation(msg)) => assert!(msg.contains("nonexistent")),
            other => panic!("expected Allocation, got {other:?}"),
        }
    }
}
