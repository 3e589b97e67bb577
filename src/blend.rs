use std::fmt::{self, Display};

use crate::errors::CanvasError;

/// Per-channel pixel-combination formula used when flattening layers.
///
/// The discriminants are the wire tags the backend interface speaks; they
/// must stay stable across providers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BlendMode {
    #[default]
    Normal = 0,
    Multiply = 1,
    Screen = 2,
    Overlay = 3,
    SoftLight = 4,
    HardLight = 5,
    ColorDodge = 6,
    ColorBurn = 7,
    Darken = 8,
    Lighten = 9,
    Difference = 10,
    Exclusion = 11,
}

impl BlendMode {
    pub const ALL: [BlendMode; 12] = [
        BlendMode::Normal,
        BlendMode::Multiply,
        BlendMode::Screen,
        BlendMode::Overlay,
        BlendMode::SoftLight,
        BlendMode::HardLight,
        BlendMode::ColorDodge,
        BlendMode::ColorBurn,
        BlendMode::Darken,
        BlendMode::Lighten,
        BlendMode::Difference,
        BlendMode::Exclusion,
    ];

    /// Wire tag as sent to the native module.
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self, CanvasError> {
        BlendMode::ALL
            .into_iter()
            .find(|m| m.tag() == tag)
            .ok_or(CanvasError::InvalidBlendMode(tag))
    }

    /// Applies the separable blend formula to one unpremultiplied channel
    /// pair: `s` is the source (layer) channel, `d` the backdrop channel,
    /// both in `[0, 1]`. Alpha handling happens in the compositor, not here.
    pub fn blend(self, s: f32, d: f32) -> f32 {
        match self {
            BlendMode::Normal => s,
            BlendMode::Multiply => s * d,
            BlendMode::Screen => s + d - s * d,
            BlendMode::Overlay => hard_light(d, s),
            BlendMode::SoftLight => {
                if s <= 0.5 {
                    d - (1.0 - 2.0 * s) * d * (1.0 - d)
                } else {
                    let g = if d <= 0.25 {
                        ((16.0 * d - 12.0) * d + 4.0) * d
                    } else {
                        d.sqrt()
                    };
                    d + (2.0 * s - 1.0) * (g - d)
                }
            }
            BlendMode::HardLight => hard_light(s, d),
            BlendMode::ColorDodge => {
                if s >= 1.0 {
                    1.0
                } else {
                    (d / (1.0 - s)).min(1.0)
                }
            }
            BlendMode::ColorBurn => {
                if s <= 0.0 {
                    0.0
                } else {
                    1.0 - ((1.0 - d) / s).min(1.0)
                }
            }
            BlendMode::Darken => s.min(d),
            BlendMode::Lighten => s.max(d),
            BlendMode::Difference => (d - s).abs(),
            BlendMode::Exclusion => d + s - 2.0 * d * s,
        }
    }
}

fn hard_light(s: f32, d: f32) -> f32 {
    if s <= 0.5 {
        2.0 * s * d
    } else {
        1.0 - 2.0 * (1.0 - s) * (1.0 - d)
    }
}

impl Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::SoftLight => "soft-light",
            BlendMode::HardLight => "hard-light",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for mode in BlendMode::ALL {
            assert_eq!(BlendMode::from_tag(mode.tag()).unwrap(), mode);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        match BlendMode::from_tag(42) {
            Err(CanvasError::InvalidBlendMode(42)) => {}
            other => panic!("expected InvalidBlendMode, got {other:?}"),
        }
    }

    #[test]
    fn normal_passes_source_through() {
        assert_eq!(BlendMode::Normal.blend(0.3, 0.9), 0.3);
    }

    #[test]
    fn multiply_and_screen() {
        assert!((BlendMode::Multiply.blend(0.5, 0.5) - 0.25).abs() < 1e-6);
        assert!((BlendMode::Screen.blend(0.5, 0.5) - 0.75).abs() < 1e-6);
        // Multiplying by white is the identity, screening with black too.
        assert_eq!(BlendMode::Multiply.blend(1.0, 0.4), 0.4);
        assert_eq!(BlendMode::Screen.blend(0.0, 0.4), 0.4);
    }

    #[test]
    fn overlay_is_hard_light_with_swapped_operands() {
        for (s, d) in [(0.2, 0.7), (0.8, 0.3), (0.5, 0.5)] {
            assert_eq!(
                BlendMode::Overlay.blend(s, d),
                BlendMode::HardLight.blend(d, s)
            );
        }
    }

    #[test]
    fn difference_and_exclusion() {
        assert!((BlendMode::Difference.blend(0.2, 0.9) - 0.7).abs() < 1e-6);
        assert!((BlendMode::Exclusion.blend(0.5, 0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn dodge_and_burn_extremes_do_not_divide_by_zero() {
        assert_eq!(BlendMode::ColorDodge.blend(1.0, 0.3), 1.0);
        assert_eq!(BlendMode::ColorBurn.blend(0.0, 0.3), 0.0);
        assert_eq!(BlendMode::ColorDodge.blend(0.5, 0.0), 0.0);
        assert_eq!(BlendMode::ColorBurn.blend(1.0, 1.0), 1.0);
    }
}
