//! Minimal end-to-end run: draw a scene on one surface and save it as PNG.
//!
//! ```sh
//! cargo run --example hello_canvas
//! ```

use std::sync::Arc;

use advancegg::backend::backends::raster::RasterBackend;
use advancegg::{CanvasBroker, Color};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let broker = CanvasBroker::new(Arc::new(RasterBackend::new()));
    let mut surface = broker.create_surface(800, 600)?;

    surface.set_rgb(0.9, 0.95, 1.0)?;
    surface.clear()?;

    // A filled circle with a gradient.
    let mut gradient = broker.create_linear_gradient(65.0, 240.0, 185.0, 360.0)?;
    gradient.add_color_stop(0.0, Color::from_hex("#ff8800")?)?;
    gradient.add_color_stop(1.0, Color::from_hex("#cc2244")?)?;
    surface.set_fill_style(&gradient)?;
    surface.draw_circle(125.0, 300.0, 60.0)?;
    surface.fill()?;

    // A dashed baseline under it.
    surface.set_rgb(0.2, 0.2, 0.25)?;
    surface.set_line_width(2.0)?;
    surface.draw_dashed_line(40.0, 400.0, 760.0, 400.0, &[12.0, 6.0])?;

    surface.draw_string("hello, canvas", 48.0, 80.0)?;

    surface.save_png("hello_canvas.png".as_ref())?;
    println!("wrote hello_canvas.png");

    gradient.dispose();
    surface.dispose();
    broker.shutdown();
    Ok(())
}
