//! Color conversions used at the interchange boundary.
//!
//! Segments persist their color as a DICOM-scaled CIE L\*a\*b\* triple
//! (Recommended Display CIELab Value). The rendering lookup tables keep 8-bit
//! RGBA. Conversions go through linear sRGB with a D65 white point.

use image::Rgba;
use palette::convert::FromColorUnclamped;
use palette::{FromColor, Hsv, Lab as CieLab, Srgb, white_point::D65};
use serde::Deserialize;

/// CIE L\*a\*b\* with L in [0, 100] and a, b in [-128, 127].
pub type Lab = [f64; 3];

/// CIE L\*a\*b\* scaled to unsigned 16-bit as stored in DICOM.
pub type DicomLab = [u16; 3];

/// Golden angle in degrees, used to spread consecutive palette hues.
const GOLDEN_ANGLE: f64 = 137.508;

/// sRGB in [0, 1] to CIE L\*a\*b\*.
pub fn rgb_to_lab(rgb: [f64; 3]) -> Lab {
    let [r, g, b] = rgb;
    let lab = CieLab::<D65, f64>::from_color(Srgb::new(r, g, b));
    [lab.l, lab.a, lab.b]
}

/// CIE L\*a\*b\* to sRGB. The result is not clamped and may leave [0, 1]
/// for colors outside the sRGB gamut.
pub fn lab_to_rgb(lab: Lab) -> [f64; 3] {
    let [l, a, b] = lab;
    let rgb = Srgb::<f64>::from_color_unclamped(CieLab::<D65, f64>::new(l, a, b));
    [rgb.red, rgb.green, rgb.blue]
}

pub fn lab_to_dicom_lab(lab: Lab) -> DicomLab {
    let scale = |v: f64| v.round().clamp(0.0, 65535.0) as u16;
    [
        scale(lab[0] * 65535.0 / 100.0),
        scale((lab[1] + 128.0) * 65535.0 / 255.0),
        scale((lab[2] + 128.0) * 65535.0 / 255.0),
    ]
}

pub fn dicom_lab_to_lab(dicom_lab: DicomLab) -> Lab {
    let [l, a, b] = dicom_lab.map(f64::from);
    [
        l * 100.0 / 65535.0,
        a * 255.0 / 65535.0 - 128.0,
        b * 255.0 / 65535.0 - 128.0,
    ]
}

#[inline]
fn unit_to_u8(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Converts a persisted color into an opaque lookup table entry.
pub fn dicom_lab_to_rgba(dicom_lab: DicomLab) -> Rgba<u8> {
    let [r, g, b] = lab_to_rgb(dicom_lab_to_lab(dicom_lab));
    Rgba([unit_to_u8(r), unit_to_u8(g), unit_to_u8(b), 255])
}

/// Converts a lookup table entry into the persisted color. Alpha is ignored.
pub fn rgba_to_dicom_lab(rgba: Rgba<u8>) -> DicomLab {
    let [r, g, b, _] = rgba.0;
    let rgb = [r, g, b].map(|c| f64::from(c) / 255.0);
    lab_to_dicom_lab(rgb_to_lab(rgb))
}

/// Saturation and value of the generated default palette.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Palette {
    pub saturation: f64,
    pub value: f64,
}

impl Default for Palette {
    fn default() -> Self {
        // Segment 1 renders as rgb(221, 85, 85)
        Self {
            saturation: 136.0 / 221.0,
            value: 221.0 / 255.0,
        }
    }
}

impl Palette {
    /// Deterministic color for a segment number. Only the number matters,
    /// so reopening the same data reproduces the same colors.
    pub fn color(&self, segment_number: u16) -> Rgba<u8> {
        if segment_number == 0 {
            return Rgba([0, 0, 0, 0]);
        }
        let hue = (f64::from(segment_number - 1) * GOLDEN_ANGLE) % 360.0;
        let hsv: Hsv<palette::encoding::Srgb, f64> = Hsv::new(hue, self.saturation, self.value);
        let rgb = Srgb::<f64>::from_color(hsv);
        Rgba([
            unit_to_u8(rgb.red),
            unit_to_u8(rgb.green),
            unit_to_u8(rgb.blue),
            255,
        ])
    }
}

/// Text color that stays legible on top of a segment color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContrastColor {
    Black,
    White,
}

impl ContrastColor {
    pub fn as_css(&self) -> &'static str {
        match self {
            ContrastColor::Black => "rgba(0,0,0,1)",
            ContrastColor::White => "rgba(255,255,255,1)",
        }
    }
}

const CONTRAST_LUMA_THRESHOLD: f64 = 165.0;

/// Picks black or white text for a background given as `rgba(r, g, b, a)`.
///
/// Luma uses the BT.2020 weights over 0-255 channels. Anything that does not
/// parse falls back to white.
pub fn contrast_color(background: &str) -> ContrastColor {
    match parse_css_rgba(background) {
        Some([r, g, b]) => contrast_from_channels(r, g, b),
        None => ContrastColor::White,
    }
}

pub fn contrast_color_for(background: Rgba<u8>) -> ContrastColor {
    let [r, g, b, _] = background.0;
    contrast_from_channels(f64::from(r), f64::from(g), f64::from(b))
}

fn contrast_from_channels(r: f64, g: f64, b: f64) -> ContrastColor {
    let luma = 0.2627 * r + 0.6780 * g + 0.0593 * b;
    if luma < CONTRAST_LUMA_THRESHOLD {
        ContrastColor::White
    } else {
        ContrastColor::Black
    }
}

/// Accepts `rgba(R,G,B,A)` with 1-3 digit channels and an alpha that is
/// either 1-3 digits or a fraction such as `0.5` or `.5`. Lookup tables store
/// alpha as 0-255, so both forms are allowed.
fn parse_css_rgba(text: &str) -> Option<[f64; 3]> {
    let text = text.trim();
    let head = text.get(..5)?;
    if !head.eq_ignore_ascii_case("rgba(") {
        return None;
    }
    let inner = text[5..].strip_suffix(')')?;
    let parts: Vec<&str> = inner.split(',').collect();
    if parts.len() != 4 {
        return None;
    }

    let channel = |part: &str| -> Option<f64> {
        let part = part.strip_prefix(' ').unwrap_or(part);
        let is_digits = (1..=3).contains(&part.len()) && part.bytes().all(|c| c.is_ascii_digit());
        is_digits.then(|| part.parse::<f64>().ok()).flatten()
    };

    let alpha = parts[3].strip_prefix(' ').unwrap_or(parts[3]);
    let alpha_ok = channel(alpha).is_some() || {
        let fraction = alpha.strip_prefix('0').unwrap_or(alpha);
        fraction
            .strip_prefix('.')
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|c| c.is_ascii_digit()))
    };
    if !alpha_ok {
        return None;
    }

    Some([channel(parts[0])?, channel(parts[1])?, channel(parts[2])?])
}
