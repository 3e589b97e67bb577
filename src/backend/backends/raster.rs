//! In-process software provider.
//!
//! Implements the full entry-point surface over straight-alpha RGBA8
//! buffers. This is the provider used by the test suite and by hosts that
//! want rendering without a native module. Text is drawn as box glyphs from
//! estimated metrics only; real shaping lives in the native renderer.

use std::collections::HashMap;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;

use crate::backend::interface::{BackendError, NativeBackend, RawHandle, RgbaImage};
use crate::blend::BlendMode;
use crate::color;
use crate::surface::dash_runs;

const CURVE_STEPS: u32 = 24;
const ARC_STEPS: u32 = 64;
/// Estimated glyph advance as a fraction of the font size.
const GLYPH_ADVANCE: f64 = 0.6;

#[derive(Debug, Clone)]
struct Subpath {
    points: Vec<(f64, f64)>,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
enum FillStyle {
    Solid,
    Gradient(RawHandle),
}

struct Canvas2D {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    color: [f64; 4],
    fill: FillStyle,
    line_width: f64,
    font_size: f64,
    path: Vec<Subpath>,
    current: Option<(f64, f64)>,
}

impl Canvas2D {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            color: [0.0, 0.0, 0.0, 1.0],
            fill: FillStyle::Solid,
            line_width: 1.0,
            font_size: 12.0,
            path: Vec::new(),
            current: None,
        }
    }

    fn open(&mut self, x: f64, y: f64) {
        self.path.push(Subpath {
            points: vec![(x, y)],
            closed: false,
        });
        self.current = Some((x, y));
    }

    fn extend(&mut self, x: f64, y: f64) {
        match self.path.last_mut() {
            Some(sub) if !sub.closed => sub.points.push((x, y)),
            // LineTo without a current point degrades to MoveTo, as the
            // original renderer does.
            _ => self.path.push(Subpath {
                points: vec![(x, y)],
                closed: false,
            }),
        }
        self.current = Some((x, y));
    }

    fn push_closed(&mut self, points: Vec<(f64, f64)>) {
        let start = points.first().copied();
        self.path.push(Subpath {
            points,
            closed: true,
        });
        self.current = start;
    }
}

struct GradientDef {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    stops: Vec<(f64, [f64; 4])>,
}

impl GradientDef {
    /// Samples the gradient at point `(x, y)`, projecting onto the axis and
    /// clamping. Stops are ordered at sampling time; endpoint positions
    /// return their stop colors exactly.
    fn sample(&self, x: f64, y: f64) -> [f64; 4] {
        if self.stops.is_empty() {
            return [0.0, 0.0, 0.0, 0.0];
        }
        let dx = self.x2 - self.x1;
        let dy = self.y2 - self.y1;
        let len2 = dx * dx + dy * dy;
        let t = if len2 == 0.0 {
            0.0
        } else {
            (((x - self.x1) * dx + (y - self.y1) * dy) / len2).clamp(0.0, 1.0)
        };

        let mut stops = self.stops.clone();
        stops.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if t <= stops[0].0 {
            return stops[0].1;
        }
        if t >= stops[stops.len() - 1].0 {
            return stops[stops.len() - 1].1;
        }
        for pair in stops.windows(2) {
            let (p0, c0) = pair[0];
            let (p1, c1) = pair[1];
            if t >= p0 && t <= p1 {
                if p1 == p0 {
                    return c1;
                }
                let f = (t - p0) / (p1 - p0);
                return [
                    c0[0] + (c1[0] - c0[0]) * f,
                    c0[1] + (c1[1] - c0[1]) * f,
                    c0[2] + (c1[2] - c0[2]) * f,
                    c0[3] + (c1[3] - c0[3]) * f,
                ];
            }
        }
        stops[stops.len() - 1].1
    }
}

struct LayerEntry {
    ctx: RawHandle,
    opacity: f64,
    blend: BlendMode,
    visible: bool,
}

struct LayerTable {
    width: u32,
    height: u32,
    order: Vec<String>,
    entries: HashMap<String, LayerEntry>,
}

#[derive(Default)]
struct RasterState {
    next: RawHandle,
    contexts: HashMap<RawHandle, Canvas2D>,
    gradients: HashMap<RawHandle, GradientDef>,
    managers: HashMap<RawHandle, LayerTable>,
}

impl RasterState {
    fn issue(&mut self) -> RawHandle {
        self.next += 1;
        self.next
    }

    fn canvas(&mut self, h: RawHandle) -> Result<&mut Canvas2D, BackendError> {
        self.contexts.get_mut(&h).ok_or(BackendError::UnknownHandle(h))
    }

    fn manager(&mut self, h: RawHandle) -> Result<&mut LayerTable, BackendError> {
        self.managers.get_mut(&h).ok_or(BackendError::UnknownHandle(h))
    }
}

/// Software renderer implementing the whole backend contract in-process.
pub struct RasterBackend {
    state: Mutex<RasterState>,
}

impl RasterBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RasterState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RasterState> {
        self.state.lock().expect("raster state poisoned")
    }
}

impl Default for RasterBackend {
    fn default() -> Self {
        Self::new()
    }
}

// -- pixel helpers -----------------------------------------------------------

/// Straight-alpha source-over of one RGBA pixel, exact when the source is
/// fully opaque.
fn blend_px(dst: &mut [u8], src: [f64; 4]) {
    let sa = src[3].clamp(0.0, 1.0);
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f64 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    for c in 0..3 {
        let dc = dst[c] as f64 / 255.0;
        let num = src[c].clamp(0.0, 1.0) * sa + dc * da * (1.0 - sa);
        dst[c] = ((num / out_a) * 255.0).round() as u8;
    }
    dst[3] = (out_a * 255.0).round() as u8;
}

enum Paint<'a> {
    Solid([f64; 4]),
    Gradient(&'a GradientDef),
}

impl Paint<'_> {
    fn at(&self, x: f64, y: f64) -> [f64; 4] {
        match self {
            Paint::Solid(c) => *c,
            Paint::Gradient(g) => g.sample(x, y),
        }
    }
}

/// Even-odd scanline fill of `subpaths`, sampling `paint` at pixel centers.
/// Open subpaths are implicitly closed for filling.
fn fill_subpaths(
    width: u32,
    height: u32,
    pixels: &mut [u8],
    subpaths: &[Subpath],
    paint: &Paint<'_>,
) {
    let mut edges: Vec<((f64, f64), (f64, f64))> = Vec::new();
    for sub in subpaths {
        if sub.points.len() < 2 {
            continue;
        }
        for pair in sub.points.windows(2) {
            edges.push((pair[0], pair[1]));
        }
        let first = sub.points[0];
        let last = sub.points[sub.points.len() - 1];
        if first != last {
            edges.push((last, first));
        }
    }
    if edges.is_empty() {
        return;
    }

    let mut xs: Vec<f64> = Vec::new();
    for y in 0..height {
        let yc = y as f64 + 0.5;
        xs.clear();
        for &((x0, y0), (x1, y1)) in &edges {
            if (y0 <= yc && yc < y1) || (y1 <= yc && yc < y0) {
                let t = (yc - y0) / (y1 - y0);
                xs.push(x0 + t * (x1 - x0));
            }
        }
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        for span in xs.chunks_exact(2) {
            let from = (span[0] - 0.5).ceil().max(0.0) as i64;
            let to = ((span[1] - 0.5).ceil() as i64).min(width as i64);
            for x in from..to {
                let xc = x as f64 + 0.5;
                let i = (y as usize * width as usize + x as usize) * 4;
                blend_px(&mut pixels[i..i + 4], paint.at(xc, yc));
            }
        }
    }
}

/// Strokes one segment as a filled quad of `width` thickness.
fn stroke_segment(
    canvas_w: u32,
    canvas_h: u32,
    pixels: &mut [u8],
    p0: (f64, f64),
    p1: (f64, f64),
    width: f64,
    paint: &Paint<'_>,
) {
    let (dx, dy) = (p1.0 - p0.0, p1.1 - p0.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return;
    }
    let half = width.max(0.0) / 2.0;
    let (nx, ny) = (-dy / len * half, dx / len * half);
    let quad = Subpath {
        points: vec![
            (p0.0 + nx, p0.1 + ny),
            (p1.0 + nx, p1.1 + ny),
            (p1.0 - nx, p1.1 - ny),
            (p0.0 - nx, p0.1 - ny),
        ],
        closed: true,
    };
    fill_subpaths(canvas_w, canvas_h, pixels, std::slice::from_ref(&quad), paint);
}

fn ellipse_points(cx: f64, cy: f64, rx: f64, ry: f64) -> Vec<(f64, f64)> {
    (0..ARC_STEPS)
        .map(|i| {
            let a = i as f64 / ARC_STEPS as f64 * std::f64::consts::TAU;
            (cx + rx * a.cos(), cy + ry * a.sin())
        })
        .collect()
}

fn rounded_rect_points(x: f64, y: f64, w: f64, h: f64, radius: f64) -> Vec<(f64, f64)> {
    let r = radius.clamp(0.0, w.min(h) / 2.0);
    // Corner centers, arcs swept clockwise starting at the top-left corner.
    let corners = [
        (x + w - r, y + r, -std::f64::consts::FRAC_PI_2),
        (x + w - r, y + h - r, 0.0),
        (x + r, y + h - r, std::f64::consts::FRAC_PI_2),
        (x + r, y + r, std::f64::consts::PI),
    ];
    let steps = 8;
    let mut points = Vec::with_capacity(corners.len() * (steps + 1));
    for (cx, cy, start) in corners {
        for i in 0..=steps {
            let a = start + i as f64 / steps as f64 * std::f64::consts::FRAC_PI_2;
            points.push((cx + r * a.cos(), cy + r * a.sin()));
        }
    }
    points
}

fn glyph_boxes(text: &str, x: f64, baseline: f64, size: f64) -> Vec<(f64, f64, f64, f64)> {
    let advance = GLYPH_ADVANCE * size;
    let mut boxes = Vec::new();
    let mut pen = x;
    for ch in text.chars() {
        if !ch.is_whitespace() {
            boxes.push((pen + 0.1 * advance, baseline - 0.7 * size, 0.8 * advance, 0.7 * size));
        }
        pen += advance;
    }
    boxes
}

fn estimated_text_width(text: &str, size: f64) -> f64 {
    text.chars().count() as f64 * GLYPH_ADVANCE * size
}

fn fill_boxes(canvas: &mut Canvas2D, boxes: &[(f64, f64, f64, f64)]) {
    let paint = Paint::Solid(canvas.color);
    for &(bx, by, bw, bh) in boxes {
        let rect = Subpath {
            points: vec![(bx, by), (bx + bw, by), (bx + bw, by + bh), (bx, by + bh)],
            closed: true,
        };
        fill_subpaths(
            canvas.width,
            canvas.height,
            &mut canvas.pixels,
            std::slice::from_ref(&rect),
            &paint,
        );
    }
}

/// Composites `src` over `dst` with the layer's blend mode, the source
/// alpha scaled by `opacity` first.
fn composite(dst: &mut [u8], src: &[u8], opacity: f64, mode: BlendMode) {
    let opacity = opacity.clamp(0.0, 1.0);
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let sa = s[3] as f64 / 255.0 * opacity;
        let da = d[3] as f64 / 255.0;
        let out_a = sa + da * (1.0 - sa);
        if out_a <= 0.0 {
            d.copy_from_slice(&[0, 0, 0, 0]);
            continue;
        }
        for c in 0..3 {
            let sc = s[c] as f64 / 255.0;
            let dc = d[c] as f64 / 255.0;
            let b = mode.blend(sc as f32, dc as f32) as f64;
            let num = sc * sa * (1.0 - da) + dc * da * (1.0 - sa) + b * sa * da;
            d[c] = ((num / out_a) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        d[3] = (out_a * 255.0).round() as u8;
    }
}

// -- encoding ----------------------------------------------------------------

fn encode_png(canvas: &Canvas2D) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, canvas.width, canvas.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| BackendError::Encode(e.to_string()))?;
        writer
            .write_image_data(&canvas.pixels)
            .map_err(|e| BackendError::Encode(e.to_string()))?;
    }
    Ok(out)
}

fn encode_jpeg(canvas: &Canvas2D, quality: u8) -> Result<Vec<u8>, BackendError> {
    // JPEG has no alpha; composite over white first.
    let mut rgb = Vec::with_capacity(canvas.pixels.len() / 4 * 3);
    for px in canvas.pixels.chunks_exact(4) {
        let a = px[3] as f64 / 255.0;
        for c in 0..3 {
            rgb.push((px[c] as f64 * a + 255.0 * (1.0 - a)).round() as u8);
        }
    }
    use image::ImageEncoder;
    let mut out = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.min(100));
    encoder
        .write_image(
            &rgb,
            canvas.width,
            canvas.height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| BackendError::Encode(e.to_string()))?;
    Ok(out)
}

impl NativeBackend for RasterBackend {
    fn name(&self) -> &str {
        "raster"
    }

    fn create_context(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::Allocation(format!(
                "degenerate surface {width}x{height}"
            )));
        }
        let mut state = self.lock();
        let h = state.issue();
        state.contexts.insert(h, Canvas2D::new(width, height));
        Ok(h)
    }

    fn destroy_context(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        state
            .contexts
            .remove(&ctx)
            .ok_or(BackendError::UnknownHandle(ctx))?;
        // A destroyed context that backed a layer takes its entry with it,
        // freeing the name for a later add.
        for table in state.managers.values_mut() {
            if let Some(name) = table
                .entries
                .iter()
                .find(|(_, e)| e.ctx == ctx)
                .map(|(name, _)| name.clone())
            {
                table.entries.remove(&name);
                table.order.retain(|n| n != &name);
            }
        }
        Ok(())
    }

    fn set_rgb(&self, ctx: RawHandle, r: f64, g: f64, b: f64) -> Result<(), BackendError> {
        self.set_rgba(ctx, r, g, b, 1.0)
    }

    fn set_rgba(&self, ctx: RawHandle, r: f64, g: f64, b: f64, a: f64) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        canvas.color = [r, g, b, a];
        canvas.fill = FillStyle::Solid;
        Ok(())
    }

    fn set_hex_color(&self, ctx: RawHandle, hex: &str) -> Result<(), BackendError> {
        let c = color::hex_to_rgb(hex).map_err(|e| BackendError::Native(e.to_string()))?;
        self.set_rgba(ctx, c.r, c.g, c.b, c.a)
    }

    fn clear(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let px = crate::color::Color::rgba(
            canvas.color[0],
            canvas.color[1],
            canvas.color[2],
            canvas.color[3],
        )
        .to_rgba8();
        for chunk in canvas.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
        Ok(())
    }

    fn set_line_width(&self, ctx: RawHandle, width: f64) -> Result<(), BackendError> {
        self.lock().canvas(ctx)?.line_width = width;
        Ok(())
    }

    fn move_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        self.lock().canvas(ctx)?.open(x, y);
        Ok(())
    }

    fn line_to(&self, ctx: RawHandle, x: f64, y: f64) -> Result<(), BackendError> {
        self.lock().canvas(ctx)?.extend(x, y);
        Ok(())
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
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let (x0, y0) = canvas.current.unwrap_or((c1x, c1y));
        for i in 1..=CURVE_STEPS {
            let t = i as f64 / CURVE_STEPS as f64;
            let u = 1.0 - t;
            let bx = u * u * u * x0 + 3.0 * u * u * t * c1x + 3.0 * u * t * t * c2x + t * t * t * x;
            let by = u * u * u * y0 + 3.0 * u * u * t * c1y + 3.0 * u * t * t * c2y + t * t * t * y;
            canvas.extend(bx, by);
        }
        Ok(())
    }

    fn close_path(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        if let Some(sub) = canvas.path.last_mut() {
            sub.closed = true;
        }
        Ok(())
    }

    fn fill(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        let state = &mut *state;
        let canvas = state
            .contexts
            .get_mut(&ctx)
            .ok_or(BackendError::UnknownHandle(ctx))?;
        let subpaths = std::mem::take(&mut canvas.path);
        canvas.current = None;

        let paint = match canvas.fill {
            FillStyle::Solid => Paint::Solid(canvas.color),
            FillStyle::Gradient(g) => match state.gradients.get(&g) {
                Some(def) => Paint::Gradient(def),
                None => return Err(BackendError::UnknownHandle(g)),
            },
        };
        fill_subpaths(canvas.width, canvas.height, &mut canvas.pixels, &subpaths, &paint);
        Ok(())
    }

    fn stroke(&self, ctx: RawHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let subpaths = std::mem::take(&mut canvas.path);
        canvas.current = None;

        let paint = Paint::Solid(canvas.color);
        let (w, h, lw) = (canvas.width, canvas.height, canvas.line_width);
        for sub in &subpaths {
            for pair in sub.points.windows(2) {
                stroke_segment(w, h, &mut canvas.pixels, pair[0], pair[1], lw, &paint);
            }
            if sub.closed && sub.points.len() > 2 {
                let last = sub.points[sub.points.len() - 1];
                stroke_segment(w, h, &mut canvas.pixels, last, sub.points[0], lw, &paint);
            }
        }
        Ok(())
    }

    fn draw_rectangle(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        canvas.push_closed(vec![
            (x, y),
            (x + width, y),
            (x + width, y + height),
            (x, y + height),
        ]);
        Ok(())
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
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        canvas.push_closed(rounded_rect_points(x, y, width, height, radius));
        Ok(())
    }

    fn draw_circle(&self, ctx: RawHandle, x: f64, y: f64, radius: f64) -> Result<(), BackendError> {
        self.draw_ellipse(ctx, x, y, radius, radius)
    }

    fn draw_ellipse(
        &self,
        ctx: RawHandle,
        x: f64,
        y: f64,
        rx: f64,
        ry: f64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        canvas.push_closed(ellipse_points(x, y, rx, ry));
        Ok(())
    }

    fn draw_line(
        &self,
        ctx: RawHandle,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        canvas.open(x1, y1);
        canvas.extend(x2, y2);
        Ok(())
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
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let (dx, dy) = (x2 - x1, y2 - y1);
        let length = (dx * dx + dy * dy).sqrt();
        if length > 0.0 {
            let (ux, uy) = (dx / length, dy / length);
            let paint = Paint::Solid(canvas.color);
            let (w, h, lw) = (canvas.width, canvas.height, canvas.line_width);
            for (from, to) in dash_runs(length, pattern) {
                stroke_segment(
                    w,
                    h,
                    &mut canvas.pixels,
                    (x1 + ux * from, y1 + uy * from),
                    (x1 + ux * to, y1 + uy * to),
                    lw,
                    &paint,
                );
            }
        }
        // Dashed lines commit immediately and drop any accumulated path.
        canvas.path.clear();
        canvas.current = None;
        Ok(())
    }

    fn draw_string(&self, ctx: RawHandle, text: &str, x: f64, y: f64) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let boxes = glyph_boxes(text, x, y, canvas.font_size);
        fill_boxes(canvas, &boxes);
        Ok(())
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
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let size = canvas.font_size;
        let width = estimated_text_width(text, size);
        let left = x - ax * width;
        let top = y - ay * size;
        let boxes = glyph_boxes(text, left, top + 0.8 * size, size);
        fill_boxes(canvas, &boxes);
        Ok(())
    }

    fn draw_text_on_circle(
        &self,
        ctx: RawHandle,
        text: &str,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Result<(), BackendError> {
        if radius <= 0.0 {
            return Err(BackendError::Native(format!("degenerate radius {radius}")));
        }
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        let size = canvas.font_size;
        let advance = GLYPH_ADVANCE * size;

        // Fixed convention: first glyph at the top of the circle, advancing
        // clockwise. With y growing downward, increasing the angle from
        // -pi/2 walks the circle clockwise on screen.
        let mut angle = -std::f64::consts::FRAC_PI_2;
        let mut boxes = Vec::new();
        for ch in text.chars() {
            if !ch.is_whitespace() {
                let gx = x + radius * angle.cos();
                let gy = y + radius * angle.sin();
                boxes.push((gx - 0.4 * advance, gy - 0.35 * size, 0.8 * advance, 0.7 * size));
            }
            angle += advance / radius;
            if angle > -std::f64::consts::FRAC_PI_2 + std::f64::consts::TAU {
                break; // no wrap-around
            }
        }
        fill_boxes(canvas, &boxes);
        Ok(())
    }

    fn load_font(&self, ctx: RawHandle, path: &str, size: f64) -> Result<(), BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        // Metrics only; glyph outlines are the native renderer's business.
        canvas.font_size = if size > 0.0 { size } else { canvas.font_size };
        log::debug!("raster: font `{path}` recorded at size {size}");
        Ok(())
    }

    fn create_linear_gradient(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Result<RawHandle, BackendError> {
        let mut state = self.lock();
        let h = state.issue();
        state.gradients.insert(
            h,
            GradientDef {
                x1,
                y1,
                x2,
                y2,
                stops: Vec::new(),
            },
        );
        Ok(h)
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
        let mut state = self.lock();
        let def = state
            .gradients
            .get_mut(&gradient)
            .ok_or(BackendError::UnknownHandle(gradient))?;
        def.stops.push((position, [r, g, b, a]));
        Ok(())
    }

    fn set_fill_style_gradient(
        &self,
        ctx: RawHandle,
        gradient: RawHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        if !state.gradients.contains_key(&gradient) {
            return Err(BackendError::UnknownHandle(gradient));
        }
        state.canvas(ctx)?.fill = FillStyle::Gradient(gradient);
        Ok(())
    }

    fn destroy_gradient(&self, gradient: RawHandle) -> Result<(), BackendError> {
        self.lock()
            .gradients
            .remove(&gradient)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle(gradient))
    }

    fn create_layer_manager(&self, width: u32, height: u32) -> Result<RawHandle, BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::Allocation(format!(
                "degenerate layer manager {width}x{height}"
            )));
        }
        let mut state = self.lock();
        let h = state.issue();
        state.managers.insert(
            h,
            LayerTable {
                width,
                height,
                order: Vec::new(),
                entries: HashMap::new(),
            },
        );
        Ok(h)
    }

    fn add_layer(&self, manager: RawHandle, name: &str) -> Result<RawHandle, BackendError> {
        let mut state = self.lock();
        let (width, height) = {
            let table = state.manager(manager)?;
            if table.entries.contains_key(name) {
                return Err(BackendError::Native(format!("layer `{name}` exists")));
            }
            (table.width, table.height)
        };
        let ctx = state.issue();
        state.contexts.insert(ctx, Canvas2D::new(width, height));
        let table = state.manager(manager)?;
        table.order.push(name.to_string());
        table.entries.insert(
            name.to_string(),
            LayerEntry {
                ctx,
                opacity: 1.0,
                blend: BlendMode::Normal,
                visible: true,
            },
        );
        Ok(ctx)
    }

    fn set_layer_opacity(
        &self,
        manager: RawHandle,
        name: &str,
        opacity: f64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let table = state.manager(manager)?;
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| BackendError::Native(format!("unknown layer `{name}`")))?;
        entry.opacity = opacity.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_layer_visible(
        &self,
        manager: RawHandle,
        name: &str,
        visible: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let table = state.manager(manager)?;
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| BackendError::Native(format!("unknown layer `{name}`")))?;
        entry.visible = visible;
        Ok(())
    }

    fn set_layer_blend_mode(
        &self,
        manager: RawHandle,
        name: &str,
        mode: BlendMode,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let table = state.manager(manager)?;
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| BackendError::Native(format!("unknown layer `{name}`")))?;
        entry.blend = mode;
        Ok(())
    }

    fn flatten_layers(&self, manager: RawHandle) -> Result<RawHandle, BackendError> {
        let mut state = self.lock();
        let (width, height, plan) = {
            let table = state.manager(manager)?;
            let plan: Vec<(RawHandle, f64, BlendMode)> = table
                .order
                .iter()
                .filter_map(|name| table.entries.get(name))
                .filter(|e| e.visible)
                .map(|e| (e.ctx, e.opacity, e.blend))
                .collect();
            (table.width, table.height, plan)
        };

        // Opaque white background, then visible layers back-to-front.
        let mut result = Canvas2D::new(width, height);
        result.pixels.fill(0xff);
        for (ctx, opacity, blend) in plan {
            // A layer whose surface was disposed independently contributes
            // nothing anymore.
            let Some(src) = state.contexts.get(&ctx) else {
                continue;
            };
            let src_pixels = src.pixels.clone();
            composite(&mut result.pixels, &src_pixels, opacity, blend);
        }

        let h = state.issue();
        state.contexts.insert(h, result);
        Ok(h)
    }

    fn destroy_layer_manager(&self, manager: RawHandle) -> Result<(), BackendError> {
        self.lock()
            .managers
            .remove(&manager)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle(manager))
    }

    fn save_png(&self, ctx: RawHandle, path: &Path) -> Result<(), BackendError> {
        let bytes = self.to_png(ctx)?;
        let file = std::fs::File::create(path).map_err(|e| BackendError::Encode(e.to_string()))?;
        use std::io::Write;
        BufWriter::new(file)
            .write_all(&bytes)
            .map_err(|e| BackendError::Encode(e.to_string()))
    }

    fn save_jpeg(&self, ctx: RawHandle, path: &Path, quality: u8) -> Result<(), BackendError> {
        let bytes = self.to_jpeg(ctx, quality)?;
        std::fs::write(path, bytes).map_err(|e| BackendError::Encode(e.to_string()))
    }

    fn to_png(&self, ctx: RawHandle) -> Result<Vec<u8>, BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        encode_png(canvas)
    }

    fn to_jpeg(&self, ctx: RawHandle, quality: u8) -> Result<Vec<u8>, BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        encode_jpeg(canvas, quality)
    }

    fn snapshot(&self, ctx: RawHandle) -> Result<RgbaImage, BackendError> {
        let mut state = self.lock();
        let canvas = state.canvas(ctx)?;
        Ok(RgbaImage::from_raw(
            canvas.pixels.clone(),
            canvas.width,
            canvas.height,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(b: &RasterBackend, ctx: RawHandle, x: u32, y: u32) -> [u8; 4] {
        b.snapshot(ctx).unwrap().pixel(x, y)
    }

    #[test]
    fn clear_then_circle_fill_end_to_end() {
        let b = RasterBackend::new();
        let ctx = b.create_context(800, 600).unwrap();
        b.set_rgb(ctx, 0.9, 0.95, 1.0).unwrap();
        b.clear(ctx).unwrap();
        b.draw_circle(ctx, 125.0, 300.0, 60.0).unwrap();
        b.fill(ctx).unwrap();

        let expected = crate::color::Color::rgb(0.9, 0.95, 1.0).to_rgba8();
        assert_eq!(pixel(&b, ctx, 125, 300), expected);
        assert_eq!(pixel(&b, ctx, 0, 0), expected);
    }

    #[test]
    fn circle_fill_color_differs_from_background() {
        let b = RasterBackend::new();
        let ctx = b.create_context(400, 400).unwrap();
        b.set_hex_color(ctx, "#FFFFFF").unwrap();
        b.clear(ctx).unwrap();
        b.set_rgb(ctx, 1.0, 0.0, 0.0).unwrap();
        b.draw_circle(ctx, 200.0, 200.0, 50.0).unwrap();
        b.fill(ctx).unwrap();

        assert_eq!(pixel(&b, ctx, 200, 200), [255, 0, 0, 255]);
        assert_eq!(pixel(&b, ctx, 10, 10), [255, 255, 255, 255]);
        // Just outside the radius stays background.
        assert_eq!(pixel(&b, ctx, 200, 130), [255, 255, 255, 255]);
    }

    #[test]
    fn gradient_endpoints_sample_exactly() {
        let b = RasterBackend::new();
        let ctx = b.create_context(11, 1).unwrap();
        let g = b.create_linear_gradient(0.5, 0.5, 10.5, 0.5).unwrap();
        b.add_color_stop(g, 0.0, 1.0, 0.0, 0.0, 1.0).unwrap();
        b.add_color_stop(g, 1.0, 0.0, 0.0, 1.0, 1.0).unwrap();
        b.set_fill_style_gradient(ctx, g).unwrap();
        b.draw_rectangle(ctx, 0.0, 0.0, 11.0, 1.0).unwrap();
        b.fill(ctx).unwrap();

        assert_eq!(pixel(&b, ctx, 0, 0), [255, 0, 0, 255]);
        assert_eq!(pixel(&b, ctx, 10, 0), [0, 0, 255, 255]);
    }

    #[test]
    fn gradient_stops_are_ordered_at_sampling_time() {
        let def = GradientDef {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 0.0,
            // Deliberately appended out of order.
            stops: vec![(1.0, [0.0, 0.0, 1.0, 1.0]), (0.0, [1.0, 0.0, 0.0, 1.0])],
        };
        assert_eq!(def.sample(0.0, 0.0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(def.sample(10.0, 0.0), [0.0, 0.0, 1.0, 1.0]);
        let mid = def.sample(5.0, 0.0);
        assert!((mid[0] - 0.5).abs() < 1e-9 && (mid[2] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dashed_line_draws_only_on_runs() {
        let b = RasterBackend::new();
        let ctx = b.create_context(32, 5).unwrap();
        b.set_rgb(ctx, 0.0, 0.0, 0.0).unwrap();
        b.set_line_width(ctx, 2.0).unwrap();
        b.draw_dashed_line(ctx, 0.0, 2.0, 30.0, 2.0, &[10.0, 5.0])
            .unwrap();

        let on = [0, 0, 0, 255];
        let off = [0, 0, 0, 0];
        assert_eq!(pixel(&b, ctx, 4, 2), on); // inside [0, 10]
        assert_eq!(pixel(&b, ctx, 12, 2), off); // inside [10, 15]
        assert_eq!(pixel(&b, ctx, 20, 2), on); // inside [15, 25]
        assert_eq!(pixel(&b, ctx, 27, 2), off); // inside [25, 30]
    }

    #[test]
    fn flatten_of_empty_manager_is_the_cleared_background() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(4, 4).unwrap();
        let flat = b.flatten_layers(mgr).unwrap();
        assert_eq!(pixel(&b, flat, 0, 0), [255, 255, 255, 255]);
        assert_eq!(pixel(&b, flat, 3, 3), [255, 255, 255, 255]);
    }

    #[test]
    fn flatten_single_opaque_normal_layer_is_identity() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(4, 4).unwrap();
        let layer = b.add_layer(mgr, "art").unwrap();
        b.set_rgb(layer, 0.2, 0.5, 0.8).unwrap();
        b.clear(layer).unwrap();

        let flat = b.flatten_layers(mgr).unwrap();
        let expected = b.snapshot(layer).unwrap();
        let got = b.snapshot(flat).unwrap();
        assert_eq!(got.pixels, expected.pixels);
    }

    #[test]
    fn invisible_layers_contribute_nothing() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(4, 4).unwrap();
        let layer = b.add_layer(mgr, "hidden").unwrap();
        b.set_rgb(layer, 1.0, 0.0, 0.0).unwrap();
        b.clear(layer).unwrap();
        b.set_layer_visible(mgr, "hidden", false).unwrap();

        let flat = b.flatten_layers(mgr).unwrap();
        assert_eq!(pixel(&b, flat, 1, 1), [255, 255, 255, 255]);
    }

    #[test]
    fn multiply_blend_darkens() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(2, 2).unwrap();
        let bottom = b.add_layer(mgr, "bottom").unwrap();
        b.set_rgb(bottom, 0.5, 0.5, 0.5).unwrap();
        b.clear(bottom).unwrap();
        let top = b.add_layer(mgr, "top").unwrap();
        b.set_rgb(top, 0.5, 0.5, 0.5).unwrap();
        b.clear(top).unwrap();
        b.set_layer_blend_mode(mgr, "top", BlendMode::Multiply).unwrap();

        let flat = b.flatten_layers(mgr).unwrap();
        // Gray quantizes to 128; multiply gives (128/255)^2 ~= 0.252 -> 64.
        assert_eq!(pixel(&b, flat, 0, 0), [64, 64, 64, 255]);
    }

    #[test]
    fn opacity_scales_source_alpha_before_compositing() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(2, 2).unwrap();
        let layer = b.add_layer(mgr, "red").unwrap();
        b.set_rgb(layer, 1.0, 0.0, 0.0).unwrap();
        b.clear(layer).unwrap();
        b.set_layer_opacity(mgr, "red", 0.5).unwrap();

        let flat = b.flatten_layers(mgr).unwrap();
        // Half red over white: r stays 255, g and b drop to 128.
        assert_eq!(pixel(&b, flat, 0, 0), [255, 128, 128, 255]);
    }

    #[test]
    fn stroked_rectangle_touches_its_border_only() {
        let b = RasterBackend::new();
        let ctx = b.create_context(20, 20).unwrap();
        b.set_rgb(ctx, 0.0, 0.0, 0.0).unwrap();
        b.set_line_width(ctx, 2.0).unwrap();
        b.draw_rectangle(ctx, 5.0, 5.0, 10.0, 10.0).unwrap();
        b.stroke(ctx).unwrap();

        assert_eq!(pixel(&b, ctx, 10, 5), [0, 0, 0, 255]); // top edge
        assert_eq!(pixel(&b, ctx, 5, 10), [0, 0, 0, 255]); // left edge
        assert_eq!(pixel(&b, ctx, 10, 10), [0, 0, 0, 0]); // interior
    }

    #[test]
    fn text_paints_something_near_the_pen() {
        let b = RasterBackend::new();
        let ctx = b.create_context(64, 32).unwrap();
        b.set_rgb(ctx, 0.0, 0.0, 0.0).unwrap();
        b.draw_string(ctx, "hi", 4.0, 20.0).unwrap();

        let img = b.snapshot(ctx).unwrap();
        let painted = img.pixels.chunks_exact(4).any(|p| p[3] != 0);
        assert!(painted, "drawString left the canvas empty");
    }

    #[test]
    fn destroying_a_layer_context_frees_its_name() {
        let b = RasterBackend::new();
        let mgr = b.create_layer_manager(4, 4).unwrap();
        let first = b.add_layer(mgr, "art").unwrap();
        b.set_rgb(first, 1.0, 0.0, 0.0).unwrap();
        b.clear(first).unwrap();
        b.destroy_context(first).unwrap();

        // The name is addable again and maps to a fresh, blank context.
        let second = b.add_layer(mgr, "art").unwrap();
        assert_ne!(first, second);
        let flat = b.flatten_layers(mgr).unwrap();
        assert_eq!(pixel(&b, flat, 0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn destroyed_context_is_unknown() {
        let b = RasterBackend::new();
        let ctx = b.create_context(4, 4).unwrap();
        b.destroy_context(ctx).unwrap();
        match b.clear(ctx) {
            Err(BackendError::UnknownHandle(h)) => assert_eq!(h, ctx),
            other => panic!("expected UnknownHandle, got {other:?}"),
        }
        // Destroying twice reports the same.
        assert!(matches!(
            b.destroy_context(ctx),
            Err(BackendError::UnknownHandle(_))
        ));
    }

    #[test]
    fn zero_sized_context_is_an_allocation_failure() {
        let b = RasterBackend::new();
        assert!(matches!(
            b.create_context(0, 10),
            Err(BackendError::Allocation(_))
        ));
    }
}
