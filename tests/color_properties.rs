//! Property-based tests for color conversions.
//!
//! Run with: cargo test --test color_properties

use dicom_seg_labelmap::color::{
    ContrastColor, Palette, contrast_color, dicom_lab_to_lab, dicom_lab_to_rgba, lab_to_dicom_lab,
    rgba_to_dicom_lab,
};
use image::Rgba;
use proptest::prelude::*;

fn arb_opaque_rgba() -> impl Strategy<Value = Rgba<u8>> {
    prop::array::uniform3(any::<u8>()).prop_map(|[r, g, b]| Rgba([r, g, b, 255]))
}

proptest! {
    #[test]
    fn rgba_survives_cielab_round_trip(rgba in arb_opaque_rgba()) {
        let back = dicom_lab_to_rgba(rgba_to_dicom_lab(rgba));
        for channel in 0..3 {
            let delta = i16::from(rgba.0[channel]) - i16::from(back.0[channel]);
            prop_assert!(delta.abs() <= 1, "{:?} came back as {:?}", rgba, back);
        }
        prop_assert_eq!(back.0[3], 255);
    }

    #[test]
    fn dicom_scaling_is_stable(lab in prop::array::uniform3(any::<u16>())) {
        let again = lab_to_dicom_lab(dicom_lab_to_lab(lab));
        prop_assert_eq!(again, lab);
    }

    #[test]
    fn palette_colors_are_opaque_and_distinct_from_neighbours(number in 1u16..2000) {
        let palette = Palette::default();
        let color = palette.color(number);
        prop_assert_eq!(color.0[3], 255);
        prop_assert_ne!(color, palette.color(number + 1));
    }

    #[test]
    fn contrast_color_never_fails(background in ".*") {
        let color = contrast_color(&background);
        prop_assert!(matches!(color, ContrastColor::Black | ContrastColor::White));
    }

    #[test]
    fn dark_grey_backgrounds_get_white_text(level in 0u8..165) {
        let css = format!("rgba({level},{level},{level},1)");
        prop_assert_eq!(contrast_color(&css), ContrastColor::White);
    }
}
