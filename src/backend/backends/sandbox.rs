//! Sandboxed-runtime provider.
//!
//! Hosts another provider on a dedicated thread and forwards every entry
//! point to it as a job over a channel, waiting for the reply. The broker
//! keeps its synchronous request/response contract; what changes is that
//! the native module only ever runs on the host thread, so a module that
//! is not thread-safe (or that the embedder wants isolated) still works.
//!
//! If the host thread dies, every subsequent call reports
//! [`BackendError::Unavailable`] instead of panicking the caller.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::backend::interface::{BackendError, NativeBackend, RawHandle, RgbaImage};
use crate::blend::BlendMode;

type Job = Box<dyn FnOnce(&dyn NativeBackend) + Send>;

/// Provider that executes a wrapped provider's entry points on its own
/// host thread.
pub struct SandboxBackend {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    host: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl SandboxBackend {
    /// Moves `inner` onto a fresh host thread and returns the forwarding
    /// facade. The inner provider is dropped on that thread when the
    /// sandbox shuts down.
    pub fn spawn(inner: Box<dyn NativeBackend>) -> Self {
        let name = format!("sandboxed({})", inner.name());
        let (tx, rx) = mpsc::channel::<Job>();
        let host = std::thread::spawn(move || {
            for job in rx {
                job(inner.as_ref());
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            host: Mutex::new(Some(host)),
            name,
        }
    }

    /// Runs one entry point on the host thread and waits for its result.
    /// A dead or shut-down host reports `Unavailable`.
    fn call<R>(
        &self,
        f: impl FnOnce(&dyn NativeBackend) -> Result<R, BackendError> + Send + 'static,
    ) -> Result<R, BackendError>
    where
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let job: Job = Box::new(move |backend| {
            let _ = reply_tx.send(f(backend));
        });
        {
            let guard = self.tx.lock().map_err(|_| BackendError::Unavailable)?;
            let Some(tx) = guard.as_ref() else {
                return Err(BackendError::Unavailable);
            };
            if tx.send(job).is_err() {
                return Err(BackendError::Unavailable);
            }
        }
        // A host that died mid-call drops the reply sender.
        reply_rx.recv().unwrap_or(Err(BackendError::Unavailable))
    }

    /// Stops accepting jobs, drains the queue, and joins the host thread.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().ok().and_then(|mut g| g.take());
        drop(tx);
        let host = self.host.lock().ok().and_then(|mut g| g.take());
        if let Some(host) = host {
            if host.join().is_err() {
                log::warn!("sandbox host thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SandboxBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NativeBackend for SandboxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_context(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        self.call(move |b| b.create_context(width, height))
    }

    fn destroy_context(&self, ctx: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.destroy_context(ctx))
    }

    fn set_rgb(&self, ctx: RawHandle, r: f64, g: f64, b: f64) -> Result<(), BackendError> {
        self.call(move |back| back.set_rgb(ctx, r, g, b))
    }

    fn set_rgba(&self, ctx: RawHandle, r: f64, g: f64, b: f64, a: f64) -> Result<(), BackendError> {
        self.call(move |back| back.set_rgba(ctx, r, g, b, a))
    }

    fn set_hex_color(&self, ctx: RawHandle, hex: &str) -> Result<(), BackendError> {
        let hex = hex.to_string();
        self.call(move |b| b.set_hex_color(ctx, &hex))
    }

    fn clear(&self, ctx: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.clear(ctx))
    }

    fn set_line_width(&self, ctx: RawHandle, width: f64) -> Result<(), BackendError> {
        self.call(move |b| b.set_line_width(ctx, width))
    }

    fn move_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        self.call(move |b| b.move_to(ctx, x, y))
    }

    fn line_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        self.call(move |b| b.line_to(ctx, x, y))
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
        self.call(move |b| b.curve_to(ctx, c1x, c1y, c2x, c2y, x, y))
    }

    fn close_path(&self, ctx: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.close_path(ctx))
    }

    fn fill(&self, ctx: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.fill(ctx))
    }

    fn stroke(&self, ctx: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.stroke(ctx))
    }

    fn draw_rectangle(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<(), BackendError> {
        self.call(move |b| b.draw_rectangle(ctx, x, y, width, height))
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
        self.call(move |b| b.draw_rounded_rectangle(ctx, x, y, width, height, radius))
    }

    fn draw_circle(&self, ctx: RawHandle, x: f64, y: f64, radius: f64) -> Result<(), BackendError> {
        self.call(move |b| b.draw_circle(ctx, x, y, radius))
    }

    fn draw_ellipse(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        rx: f64,
        ry: f64,
    ) -> Result<(), BackendError> {
        self.call(move |b| b.draw_ellipse(ctx, x, y, rx, ry))
    }

    fn draw_line(
        &self,
        ctx: RawHandle,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<(), BackendError> {
        self.call(move |b| b.draw_line(ctx, x1, y1, x2, y2))
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
        let pattern = pattern.to_vec();
        self.call(move |b| b.draw_dashed_line(ctx, x1, y1, x2, y2, &pattern))
    }

    fn draw_string(&self, ctx: RawHandle, text: &str, x: f64, y: f64) -> Result<(), BackendError> {
        let text = text.to_string();
        self.call(move |b| b.draw_string(ctx, &text, x, y))
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
        let text = text.to_string();
        self.call(move |b| b.draw_string_anchored(ctx, &text, x, y, ax, ay))
    }

    fn draw_text_on_circle(
        &self,
        ctx: RawHandle,
        text: &str,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Result<(), BackendError> {
        let text = text.to_string();
        self.call(move |b| b.draw_text_on_circle(ctx, &text, x, y, radius))
    }

    fn load_font(&self, ctx: RawHandle, path: &str, size: f64) -> Result<(), BackendError> {
        let path = path.to_string();
        self.call(move |b| b.load_font(ctx, &path, size))
    }

    fn create_linear_gradient(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<RawHandle, BackendError> {
        self.call(move |b| b.create_linear_gradient(x1, y1, x2, y2))
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
        self.call(move |back| back.add_color_stop(gradient, position, r, g, b, a))
    }

    fn set_fill_style_gradient(
        &self,
        ctx: RawHandle,
        gradient: RawHandle,
    ) -> Result<(), BackendError> {
        self.call(move |b| b.set_fill_style_gradient(ctx, gradient))
    }

    fn destroy_gradient(&self, gradient: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.destroy_gradient(gradient))
    }

    fn create_layer_manager(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        self.call(move |b| b.create_layer_manager(width, height))
    }

    fn add_layer(&self, manager: RawHandle, name: &str) -> Result<RawHandle, BackendError> {
        let name = name.to_string();
        self.call(move |b| b.add_layer(manager, &name))
    }

    fn set_layer_opacity(
        &self,
        manager: RawHandle,
        name: &str,
        opacity: f64,
    ) -> Result<(), BackendError> {
        let name = name.to_string();
        self.call(move |b| b.set_layer_opacity(manager, &name, opacity))
    }

    fn set_layer_visible(
        &self,
        manager: RawHandle,
        name: &str,
        visible: bool,
    ) -> Result<(), BackendError> {
        let name = name.to_string();
        self.call(move |b| b.set_layer_visible(manager, &name, visible))
    }

    fn set_layer_blend_mode(
        &self,
        manager: RawHandle,
        name: &str,
        mode: BlendMode,
    ) -> Result<(), BackendError> {
        let name = name.to_string();
        self.call(move |b| b.set_layer_blend_mode(manager, &name, mode))
    }

    fn flatten_layers(&self, manager: RawHandle) -> Result<RawHandle, BackendError> {
        self.call(move |b| b.flatten_layers(manager))
    }

    fn destroy_layer_manager(&self, manager: RawHandle) -> Result<(), BackendError> {
        self.call(move |b| b.destroy_layer_manager(manager))
    }

    fn save_png(&self, ctx: RawHandle, path: &Path) -> Result<(), BackendError> {
        let path = path.to_path_buf();
        self.call(move |b| b.save_png(ctx, &path))
    }

    fn save_jpeg(&self, ctx: RawHandle, path: &Path, quality: u8) -> Result<(), BackendError> {
        let path = path.to_path_buf();
        self.call(move |b| b.save_jpeg(ctx, &path, quality))
    }

    fn to_png(&self, ctx: RawHandle) -> Result<Vec<u8>, BackendError> {
        self.call(move |b| b.to_png(ctx))
    }

    fn to_jpeg(&self, ctx: RawHandle, quality: u8) -> Result<Vec<u8>, BackendError> {
        self.call(move |b| b.to_jpeg(ctx, quality))
    }

    fn snapshot(&self, ctx: RawHandle) -> Result<RgbaImage, BackendError> {
        self.call(move |b| b.snapshot(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;

    fn sandboxed() -> SandboxBackend {
        SandboxBackend::spawn(Box::new(RasterBackend::new()))
    }

    #[test]
    fn renders_identically_to_the_wrapped_provider() {
        let draw = |b: &dyn NativeBackend| -> RgbaImage {
            let ctx = b.create_context(32, 32).unwrap();
            b.set_rgb(ctx, 0.9, 0.95, 1.0).unwrap();
            b.clear(ctx).unwrap();
            b.set_rgb(ctx, 1.0, 0.0, 0.0).unwrap();
            b.draw_circle(ctx, 16.0, 16.0, 8.0).unwrap();
            b.fill(ctx).unwrap();
            b.snapshot(ctx).unwrap()
        };

        let direct = draw(&RasterBackend::new());
        let hosted = draw(&sandboxed());
        assert_eq!(direct.pixels, hosted.pixels);
    }

    #[test]
    fn missing_entry_points_pass_through() {
        struct Bare;
        impl NativeBackend for Bare {
            fn name(&self) -> &str {
                "bare"
            }
        }

        let s = SandboxBackend::spawn(Box::new(Bare));
        match s.create_context(8, 8) {
            Err(BackendError::MissingEntryPoint("createContext")) => {}
            other => panic!("expected MissingEntryPoint, got {other:?}"),
        }
    }

    #[test]
    fn calls_after_shutdown_report_unavailable() {
        let s = sandboxed();
        let ctx = s.create_context(8, 8).unwrap();
        s.shutdown();
        s.shutdown(); // idempotent
        match s.clear(ctx) {
            Err(BackendError::Unavailable) => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn facade_name_reports_the_wrapped_provider() {
        assert_eq!(sandboxed().name(), "sandboxed(raster)");
    }
}
