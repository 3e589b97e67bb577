//! Layer-stack composition: draw on named layers, tweak their composition
//! parameters, flatten, and save the result.
//!
//! ```sh
//! cargo run --example layered_scene
//! ```

use std::sync::Arc;

use advancegg::backend::backends::raster::RasterBackend;
use advancegg::{BlendMode, CanvasBroker};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let broker = CanvasBroker::new(Arc::new(RasterBackend::new()));
    let mut stack = broker.create_layer_stack(640, 480)?;

    {
        let background = stack.add_layer("background")?;
        background.set_hex_color("#204060")?;
        background.clear()?;
    }

    {
        let shapes = stack.add_layer("shapes")?;
        shapes.set_rgb(1.0, 0.85, 0.2)?;
        shapes.draw_circle(320.0, 240.0, 120.0)?;
        shapes.fill()?;
        shapes.set_rgb(0.9, 0.3, 0.3)?;
        shapes.draw_rounded_rectangle(80.0, 80.0, 200.0, 140.0, 24.0)?;
        shapes.fill()?;
    }

    {
        let glow = stack.add_layer("glow")?;
        glow.set_rgba(1.0, 1.0, 1.0, 0.9)?;
        glow.draw_ellipse(320.0, 120.0, 260.0, 60.0)?;
        glow.fill()?;
    }

    stack.set_layer_opacity("glow", 0.4)?;
    stack.set_layer_blend_mode("glow", BlendMode::Screen)?;
    stack.set_layer_blend_mode("shapes", BlendMode::Multiply)?;

    let mut flat = stack.flatten()?;
    flat.save_png("layered_scene.png".as_ref())?;
    println!("wrote layered_scene.png ({} layers)", stack.len());

    flat.dispose();
    stack.dispose();
    broker.shutdown();
    Ok(())
}
