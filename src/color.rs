use crate::errors::CanvasError;

/// RGBA color with floating point channels in `[0, 1]`, the encoding the
/// native module speaks on its entry points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Color {
    pub const fn rgba(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const WHITE: Color = Color::rgb(1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::rgb(0.0, 0.0, 0.0);
    pub const TRANSPARENT: Color = Color::rgba(0.0, 0.0, 0.0, 0.0);

    /// Parses a `#RRGGBB` color, case-insensitive. The leading `#` may be
    /// omitted. Anything else is an [`CanvasError::InvalidColor`].
    pub fn from_hex(hex: &str) -> Result<Self, CanvasError> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CanvasError::InvalidColor(hex.to_string()));
        }

        let channel = |range: std::ops::Range<usize>| -> f64 {
            // Validated above, cannot fail.
            u8::from_str_radix(&digits[range], 16).unwrap_or(0) as f64 / 255.0
        };

        Ok(Self::rgb(channel(0..2), channel(2..4), channel(4..6)))
    }

    /// Formats as lowercase `#rrggbb`; alpha is not representable in the
    /// hex wire encoding and is dropped.
    pub fn to_hex(&self) -> String {
        rgb_to_hex(self.r, self.g, self.b)
    }

    /// Quantizes to straight-alpha RGBA8, the raster backend's pixel format.
    pub fn to_rgba8(&self) -> [u8; 4] {
        let q = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }
}

/// Parses `#RRGGBB` (case-insensitive) into a [`Color`].
pub fn hex_to_rgb(hex: &str) -> Result<Color, CanvasError> {
    Color::from_hex(hex)
}

/// Formats float channels as lowercase `#rrggbb`.
pub fn rgb_to_hex(r: f64, g: f64, b: f64) -> String {
    let q = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", q(r), q(g), q(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upper_and_lower_case() {
        let upper = Color::from_hex("#1A2B3C").unwrap();
        let lower = Color::from_hex("#1a2b3c").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.a, 1.0);
    }

    #[test]
    fn leading_hash_is_optional() {
        assert_eq!(
            Color::from_hex("ff0000").unwrap(),
            Color::from_hex("#FF0000").unwrap()
        );
    }

    #[test]
    fn hex_round_trip_is_case_insensitive_identity() {
        let c = hex_to_rgb("#1A2B3C").unwrap();
        assert_eq!(c.to_hex(), "#1a2b3c");
    }

    #[test]
    fn malformed_input_is_invalid_color() {
        for bad in ["", "#", "#12345", "#1234567", "#12345g", "red"] {
            match Color::from_hex(bad) {
                Err(CanvasError::InvalidColor(s)) => assert_eq!(s, bad),
                other => panic!("expected InvalidColor for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn quantization_rounds_to_nearest() {
        assert_eq!(Color::rgb(0.0, 0.5, 1.0).to_rgba8(), [0, 128, 255, 255]);
        assert_eq!(rgb_to_hex(0.0, 0.5, 1.0), "#0080ff");
    }

    #[test]
    fn out_of_range_channels_are_clamped_on_format() {
        assert_eq!(rgb_to_hex(-0.5, 2.0, 1.0), "#00ffff");
    }
}
