use std::path::Path;
use std::sync::Arc;

use crate::backend::interface::RgbaImage;
use crate::errors::CanvasError;
use crate::gradient::Gradient;
use crate::registry::{Family, HandleRegistry, ManagedId, ResourceKind};

/// Default JPEG quality when the caller does not pass one.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Phase of the path accumulator. Drawing calls move the surface through
/// this machine before anything is forwarded to the native module.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PathPhase {
    /// No pending path; `fill`/`stroke` commit nothing.
    #[default]
    Empty,
    /// A subpath is open and has a current point.
    OpenSubpath,
    /// The last subpath was explicitly closed.
    ClosedSubpath,
}

/// Stateful path/paint context bound to one native resource.
///
/// All pixel work happens in the native module; this object owns the managed
/// reference, validates inputs, tracks the path state machine and forwards
/// each call verbatim to the matching backend entry point.
pub struct DrawingSurface {
    registry: Arc<HandleRegistry>,
    id: ManagedId,
    width: u32,
    height: u32,
    phase: PathPhase,
    current: Option<(f64, f64)>,
    jpeg_quality: u8,
    disposed: bool,
}

impl DrawingSurface {
    /// Allocates a fresh native context. This is the only public-facing
    /// construction path; wrapping pre-existing native ids goes through
    /// [`DrawingSurface::from_native`].
    pub(crate) fn create(
        registry: &Arc<HandleRegistry>,
        width: u32,
        height: u32,
        jpeg_quality: u8,
    ) -> Result<Self, CanvasError> {
        let id = registry.allocate(ResourceKind::Surface { width, height })?;
        Ok(Self::wrap(registry, id, width, height, jpeg_quality))
    }

    /// Internal factory: adopts a native context that already exists (layer
    /// surfaces, flatten results) without allocating a new one.
    pub(crate) fn from_native(
        registry: &Arc<HandleRegistry>,
        handle: u64,
        width: u32,
        height: u32,
        jpeg_quality: u8,
    ) -> Result<Self, CanvasError> {
        let id = registry.adopt(handle, Family::Surface)?;
        Ok(Self::wrap(registry, id, width, height, jpeg_quality))
    }

    fn wrap(
        registry: &Arc<HandleRegistry>,
        id: ManagedId,
        width: u32,
        height: u32,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            registry: Arc::clone(registry),
            id,
            width,
            height,
            phase: PathPhase::Empty,
            current: None,
            jpeg_quality,
            disposed: false,
        }
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

    pub fn path_phase(&self) -> PathPhase {
        self.phase
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn live(&self) -> Result<ManagedId, CanvasError> {
        if self.disposed {
            Err(CanvasError::UseAfterDispose(self.id))
        } else {
            Ok(self.id)
        }
    }

    fn forward<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&dyn crate::backend::interface::NativeBackend, u64) -> Result<T, crate::backend::interface::BackendError>,
    ) -> Result<T, CanvasError> {
        let id = self.live()?;
        self.registry.with_handle(id, op, f)
    }

    // -- paint state ---------------------------------------------------------

    pub fn set_rgb(&mut self, r: f64, g: f64, b: f64) -> Result<(), CanvasError> {
        self.forward("setRGB", |b_, h| b_.set_rgb(h, r, g, b))
    }

    pub fn set_rgba(&mut self, r: f64, g: f64, b: f64, a: f64) -> Result<(), CanvasError> {
        self.forward("setRGBA", |b_, h| b_.set_rgba(h, r, g, b, a))
    }

    /// Sets the paint color from a `#RRGGBB` string. Malformed input is
    /// rejected here, before the native module is involved.
    pub fn set_hex_color(&mut self, hex: &str) -> Result<(), CanvasError> {
        crate::color::hex_to_rgb(hex)?;
        self.forward("setHexColor", |b, h| b.set_hex_color(h, hex))
    }

    /// Switches the active fill source to a shared gradient. Attaching is a
    /// subscription, not a clone: stops added to the gradient afterwards
    /// affect every attached surface.
    pub fn set_fill_style(&mut self, gradient: &Gradient) -> Result<(), CanvasError> {
        let grad = self.registry.resolve(gradient.id())?;
        self.forward("setFillStyleGradient", |b, h| {
            b.set_fill_style_gradient(h, grad)
        })
    }

    pub fn set_line_width(&mut self, width: f64) -> Result<(), CanvasError> {
        self.forward("setLineWidth", |b, h| b.set_line_width(h, width))
    }

    /// Fills the whole surface with the current color.
    pub fn clear(&mut self) -> Result<(), CanvasError> {
        self.forward("clear", |b, h| b.clear(h))
    }

    // -- path construction ---------------------------------------------------

    /// Starts a new subpath. Any unclosed prior subpath loses its pending
    /// close; the accumulated segments stay until the next commit.
    pub fn move_to(&mut self, x: f64, y: f64) -> Result<(), CanvasError> {
        self.forward("moveTo", |b, h| b.move_to(h, x, y))?;
        self.phase = PathPhase::OpenSubpath;
        self.current = Some((x, y));
        Ok(())
    }

    pub fn line_to(&mut self, x: f64, y: f64) -> Result<(), CanvasError> {
        self.live()?;
        if self.current.is_none() {
            return Err(CanvasError::NoCurrentPoint);
        }
        self.forward("lineTo", |b, h| b.line_to(h, x, y))?;
        self.phase = PathPhase::OpenSubpath;
        self.current = Some((x, y));
        Ok(())
    }

    pub fn curve_to(
        &mut self,
        c1x: f64,
        c1y: f64,
        c2x: f64,
        c2y: f64,
        x: f64,
        y: f64,
    ) -> Result<(), CanvasError> {
        self.live()?;
        if self.current.is_none() {
            return Err(CanvasError::NoCurrentPoint);
        }
        self.forward("curveTo", |b, h| b.curve_to(h, c1x, c1y, c2x, c2y, x, y))?;
        self.phase = PathPhase::OpenSubpath;
        self.current = Some((x, y));
        Ok(())
    }

    /// Appends the implicit closing segment of the open subpath.
    pub fn close_path(&mut self) -> Result<(), CanvasError> {
        self.live()?;
        if self.phase != PathPhase::OpenSubpath {
            return Err(CanvasError::NoCurrentPoint);
        }
        self.forward("closePath", |b, h| b.close_path(h))?;
        self.phase = PathPhase::ClosedSubpath;
        Ok(())
    }

    /// Commits the accumulated path as a fill against the current paint
    /// state and resets the accumulator. Immediate-mode: each call is a
    /// discrete commit.
    pub fn fill(&mut self) -> Result<(), CanvasError> {
        self.forward("fill", |b, h| b.fill(h))?;
        self.reset_path();
        Ok(())
    }

    /// Commits the accumulated path as a stroke and resets the accumulator.
    pub fn stroke(&mut self) -> Result<(), CanvasError> {
        self.forward("stroke", |b, h| b.stroke(h))?;
        self.reset_path();
        Ok(())
    }

    fn reset_path(&mut self) {
        self.phase = PathPhase::Empty;
        self.current = None;
    }

    // -- shape sugar ---------------------------------------------------------

    pub fn draw_rectangle(&mut self, x: f64, y: f64, w: f64, h: f64) -> Result<(), CanvasError> {
        self.forward("drawRectangle", |b, ctx| b.draw_rectangle(ctx, x, y, w, h))?;
        self.phase = PathPhase::ClosedSubpath;
        self.current = Some((x, y));
        Ok(())
    }

    pub fn draw_rounded_rectangle(
        &mut self,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
        radius: f64,
    ) -> Result<(), CanvasError> {
        self.forward("drawRoundedRectangle", |b, ctx| {
            b.draw_rounded_rectangle(ctx, x, y, w, h, radius)
        })?;
        self.phase = PathPhase::ClosedSubpath;
        self.current = Some((x, y));
        Ok(())
    }

    pub fn draw_circle(&mut self, x: f64, y: f64, radius: f64) -> Result<(), CanvasError> {
        self.forward("drawCircle", |b, ctx| b.draw_circle(ctx, x, y, radius))?;
        self.phase = PathPhase::ClosedSubpath;
        self.current = Some((x + radius, y));
        Ok(())
    }

    pub fn draw_ellipse(&mut self, x: f64, y: f64, rx: f64, ry: f64) -> Result<(), CanvasError> {
        self.forward("drawEllipse", |b, ctx| b.draw_ellipse(ctx, x, y, rx, ry))?;
        self.phase = PathPhase::ClosedSubpath;
        self.current = Some((x + rx, y));
        Ok(())
    }

    /// Appends an open subpath from `(x1, y1)` to `(x2, y2)`.
    pub fn draw_line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> Result<(), CanvasError> {
        self.forward("drawLine", |b, ctx| b.draw_line(ctx, x1, y1, x2, y2))?;
        self.phase = PathPhase::OpenSubpath;
        self.current = Some((x2, y2));
        Ok(())
    }

    /// Strokes the alternating on/off runs of `pattern` along the segment.
    /// Commits immediately; the path accumulator is left empty.
    pub fn draw_dashed_line(
        &mut self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        pattern: &[f64],
    ) -> Result<(), CanvasError> {
        self.forward("drawDashedLine", |b, ctx| {
            b.draw_dashed_line(ctx, x1, y1, x2, y2, pattern)
        })?;
        self.reset_path();
        Ok(())
    }

    // -- text ----------------------------------------------------------------

    pub fn draw_string(&mut self, text: &str, x: f64, y: f64) -> Result<(), CanvasError> {
        self.forward("drawString", |b, ctx| b.draw_string(ctx, text, x, y))
    }

    /// Draws `text` so the fraction `(ax, ay)` of its bounding box lands on
    /// `(x, y)`: `(0, 0)` anchors the top-left corner, `(0.5, 0.5)` the
    /// center.
    pub fn draw_string_anchored(
        &mut self,
        text: &str,
        x: f64,
        y: f64,
        ax: f64,
        ay: f64,
    ) -> Result<(), CanvasError> {
        self.forward("drawStringAnchored", |b, ctx| {
            b.draw_string_anchored(ctx, text, x, y, ax, ay)
        })
    }

    /// Lays glyphs along the circle of `radius` around `(x, y)`, starting at
    /// the top and proceeding clockwise.
    pub fn draw_text_on_circle(
        &mut self,
        text: &str,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Result<(), CanvasError> {
        self.forward("drawTextOnCircle", |b, ctx| {
            b.draw_text_on_circle(ctx, text, x, y, radius)
        })
    }

    pub fn load_font(&mut self, path: &str, size: f64) -> Result<(), CanvasError> {
        self.forward("loadFont", |b, ctx| b.load_font(ctx, path, size))
    }

    // -- encoding ------------------------------------------------------------

    pub fn save_png(&self, path: &Path) -> Result<(), CanvasError> {
        self.forward("savePNG", |b, ctx| b.save_png(ctx, path))
    }

    /// Encodes to JPEG on disk. `quality` defaults to 95 and is clamped to
    /// `[0, 100]`.
    pub fn save_jpeg(&self, path: &Path, quality: Option<i32>) -> Result<(), CanvasError> {
        let q = self.clamp_quality(quality);
        self.forward("saveJPEG", |b, ctx| b.save_jpeg(ctx, path, q))
    }

    pub fn to_png(&self) -> Result<Vec<u8>, CanvasError> {
        self.forward("toPNG", |b, ctx| b.to_png(ctx))
    }

    pub fn to_jpeg(&self, quality: Option<i32>) -> Result<Vec<u8>, CanvasError> {
        let q = self.clamp_quality(quality);
        self.forward("toJPEG", |b, ctx| b.to_jpeg(ctx, q))
    }

    fn clamp_quality(&self, quality: Option<i32>) -> u8 {
        match quality {
            Some(q) => q.clamp(0, 100) as u8,
            None => self.jpeg_quality,
        }
    }

    /// RGBA8 readback of the current raster.
    pub fn snapshot(&self) -> Result<RgbaImage, CanvasError> {
        self.forward("snapshot", |b, ctx| b.snapshot(ctx))
    }

    // -- lifecycle -----------------------------------------------------------

    /// Releases the native resource. Never raises and is idempotent; any
    /// subsequent drawing call fails with `UseAfterDispose`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.registry.release(self.id);
        self.disposed = true;
    }
}

impl std::fmt::Debug for DrawingSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawingSurface")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("phase", &self.phase)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

/// On-runs of a dash pattern walked cyclically along a segment of `length`,
/// clipped at the segment end. Returned as `(start, end)` distances from the
/// segment origin. A pattern that cannot advance (empty, or summing to zero)
/// yields one solid run.
pub fn dash_runs(length: f64, pattern: &[f64]) -> Vec<(f64, f64)> {
    if length <= 0.0 {
        return Vec::new();
    }
    if pattern.is_empty() || pattern.iter().sum::<f64>() <= 0.0 {
        return vec![(0.0, length)];
    }

    let mut runs = Vec::new();
    let mut at = 0.0;
    let mut index = 0usize;
    let mut drawing = true;
    while at < length {
        let step = pattern[index % pattern.len()].max(0.0);
        let end = (at + step).min(length);
        if drawing && end > at {
            runs.push((at, end));
        }
        at = end;
        index += 1;
        drawing = !drawing;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backends::raster::RasterBackend;
    use crate::registry::HandleRegistry;
    use std::sync::Arc;

    fn surface() -> DrawingSurface {
        let registry = Arc::new(HandleRegistry::new(Arc::new(RasterBackend::new())));
        DrawingSurface::create(&registry, 32, 32, DEFAULT_JPEG_QUALITY).unwrap()
    }

    #[test]
    fn line_to_without_move_to_has_no_current_point() {
        let mut s = surface();
        match s.line_to(10.0, 10.0) {
            Err(CanvasError::NoCurrentPoint) => {}
            other => panic!("expected NoCurrentPoint, got {other:?}"),
        }
        match s.curve_to(0.0, 0.0, 1.0, 1.0, 2.0, 2.0) {
            Err(CanvasError::NoCurrentPoint) => {}
            other => panic!("expected NoCurrentPoint, got {other:?}"),
        }
    }

    #[test]
    fn path_machine_walks_empty_open_closed() {
        let mut s = surface();
        assert_eq!(s.path_phase(), PathPhase::Empty);

        s.move_to(2.0, 2.0).unwrap();
        assert_eq!(s.path_phase(), PathPhase::OpenSubpath);

        s.line_to(20.0, 2.0).unwrap();
        s.line_to(20.0, 20.0).unwrap();
        s.close_path().unwrap();
        assert_eq!(s.path_phase(), PathPhase::ClosedSubpath);

        s.fill().unwrap();
        assert_eq!(s.path_phase(), PathPhase::Empty);

        // The commit consumed the current point as well.
        match s.line_to(5.0, 5.0) {
            Err(CanvasError::NoCurrentPoint) => {}
            other => panic!("expected NoCurrentPoint, got {other:?}"),
        }
    }

    #[test]
    fn close_path_needs_an_open_subpath() {
        let mut s = surface();
        match s.close_path() {
            Err(CanvasError::NoCurrentPoint) => {}
            other => panic!("expected NoCurrentPoint, got {other:?}"),
        }
    }

    #[test]
    fn malformed_hex_is_rejected_before_the_backend() {
        let mut s = surface();
        match s.set_hex_color("#12345z") {
            Err(CanvasError::InvalidColor(_)) => {}
            other => panic!("expected InvalidColor, got {other:?}"),
        }
        s.set_hex_color("#A1B2C3").unwrap();
    }

    #[test]
    fn dispose_is_idempotent_and_poisons_operations() {
        let mut s = surface();
        let id = s.id();
        s.dispose();
        s.dispose(); // second dispose never raises

        match s.set_rgb(1.0, 0.0, 0.0) {
            Err(CanvasError::UseAfterDispose(got)) => assert_eq!(got, id),
            other => panic!("expected UseAfterDispose, got {other:?}"),
        }
        match s.to_png() {
            Err(CanvasError::UseAfterDispose(_)) => {}
            other => panic!("expected UseAfterDispose, got {other:?}"),
        }
    }

    #[test]
    fn png_and_jpeg_encode_round_trip_magic_bytes() {
        let mut s = surface();
        s.set_rgb(0.2, 0.4, 0.6).unwrap();
        s.clear().unwrap();

        let png = s.to_png().unwrap();
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]);

        // Out-of-range quality is clamped, not rejected.
        let jpeg = s.to_jpeg(Some(250)).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn save_png_writes_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");

        let mut s = surface();
        s.set_hex_color("#336699").unwrap();
        s.clear().unwrap();
        s.save_png(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn dash_runs_cycle_and_clip() {
        // [10, 5] over 30 units: on [0,10], off [10,15], on [15,25], off [25,30].
        assert_eq!(dash_runs(30.0, &[10.0, 5.0]), vec![(0.0, 10.0), (15.0, 25.0)]);

        // A run clipped by the segment end stays partial.
        assert_eq!(
            dash_runs(23.0, &[10.0, 5.0]),
            vec![(0.0, 10.0), (15.0, 23.0)]
        );

        // Degenerate patterns fall back to a solid stroke.
        assert_eq!(dash_runs(12.0, &[]), vec![(0.0, 12.0)]);
        assert_eq!(dash_runs(12.0, &[0.0, 0.0]), vec![(0.0, 12.0)]);
        assert!(dash_runs(0.0, &[10.0, 5.0]).is_empty());
    }

    #[test]
    fn debug_output_carries_identity_not_registry_guts() {
        let s = surface();
        let rendered = format!("{s:?}");
        assert!(rendered.contains("DrawingSurface"));
        assert!(rendered.contains("disposed: false"));
    }

    #[test]
    fn dashed_line_commits_immediately() {
        let mut s = surface();
        s.move_to(1.0, 1.0).unwrap();
        s.draw_dashed_line(0.0, 0.0, 30.0, 0.0, &[10.0, 5.0]).unwrap();
        assert_eq!(s.path_phase(), PathPhase::Empty);
    }
}
