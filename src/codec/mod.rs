//! Conversion between label volumes and DICOM Segmentation objects.
//!
//! The codec is a pure transformation layer: it never touches the session,
//! never performs I/O beyond (de)serialising an in-memory byte buffer, and
//! reports non-fatal findings as [`DecodeWarning`]s next to its result.
//!
//! Binary segmentations store one 1-bit mask plane per (frame, segment)
//! pair. A label volume stores one value per pixel, so two segments claiming
//! the same pixel cannot both survive decoding: the plane that comes later in
//! the object wins and the collapse is reported as
//! [`DecodeWarning::OverlapCollapsed`].

mod decode;
mod encode;
mod mask;

pub use decode::{DecodedColors, DecodedSegmentation, SegDecoder};
pub use encode::{EncodedSegmentation, SegEncoder, SeriesOptions};

use dicom::core::Tag;
use thiserror::Error;

use crate::enums::CodedField;
use crate::segment::SegmentNumber;

/// Recommended Display CIELab Value (0062,000D).
pub(crate) const RECOMMENDED_DISPLAY_CIELAB_VALUE: Tag = Tag(0x0062, 0x000D);

/// ROI Display Color (3006,002A), written by some tools instead of CIELab.
pub(crate) const ROI_DISPLAY_COLOR: Tag = Tag(0x3006, 0x002A);

pub(crate) const SEGMENT_LABEL_FALLBACK_PREFIX: &str = "Tissue";

#[derive(Debug, Error)]
pub enum CodecEncodeError {
    #[error("No segmentation volume to encode")]
    NoVolume,

    #[error("Segmentation volume has no resolved reference frames")]
    NoReferenceFrames,

    #[error("Inconsistent reference frame dimensions")]
    InconsistentDimensions,

    #[error("Frames of {rows}x{columns} pixels exceed the DICOM size limit")]
    FrameTooLarge { rows: u32, columns: u32 },

    #[error("Too many mask planes for one object: {0}")]
    TooManyFrames(usize),

    #[error("DICOM write error: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum CodecDecodeError {
    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Object is not a DICOM Segmentation")]
    NotASegmentation,

    #[error("Missing attribute {0}")]
    MissingAttribute(&'static str),

    #[error("Unsupported Bits Allocated: {0}")]
    UnsupportedBitsAllocated(u16),

    #[error("No reference frames to decode against")]
    NoReferenceFrames,

    #[error("Mask plane references unknown frame {uid}")]
    UnknownReferencedFrame { uid: String },

    #[error(
        "{planes} mask planes cannot be matched to {reference_frames} reference frames and {segments} segments"
    )]
    FrameCountMismatch {
        planes: usize,
        reference_frames: usize,
        segments: usize,
    },

    #[error("Frame {frame_id} is {expected:?} but the segmentation is {actual:?}")]
    DimensionMismatch {
        frame_id: String,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Pixel data has {actual} bytes, expected at least {expected}")]
    TruncatedPixelData { expected: usize, actual: usize },
}

/// Metadata that was absent and had to be filled in while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultedField {
    /// The segment appears in pixel data but has no Segment Sequence item.
    Record,
    Label,
    Category,
    PropertyType,
    AlgorithmName,
}

/// Non-fatal findings collected while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    /// A coded property has no counterpart in the coding catalog. The codes
    /// are kept as read.
    UnmatchedMetadata {
        segment_number: SegmentNumber,
        unmatched: Vec<(CodedField, String)>,
    },
    DefaultedMetadata {
        segment_number: SegmentNumber,
        defaulted: Vec<DefaultedField>,
    },
    /// Pixels claimed by more than one segment on a frame.
    OverlapCollapsed { frame_index: usize, pixels: usize },
}

impl DecodeWarning {
    pub fn segment_number(&self) -> Option<SegmentNumber> {
        match self {
            DecodeWarning::UnmatchedMetadata { segment_number, .. }
            | DecodeWarning::DefaultedMetadata { segment_number, .. } => Some(*segment_number),
            DecodeWarning::OverlapCollapsed { .. } => None,
        }
    }

    /// Human readable text for the host to display.
    pub fn message(&self) -> String {
        match self {
            DecodeWarning::UnmatchedMetadata { unmatched, .. } => {
                let parts: Vec<String> = unmatched
                    .iter()
                    .map(|(field, meaning)| format!("{field} \"{meaning}\""))
                    .collect();
                let joined = match parts.as_slice() {
                    [] => String::new(),
                    [only] => only.clone(),
                    [init @ .., last] => format!("{} and {last}", init.join(", ")),
                };
                format!("Unable to match {joined} from metadata with standard code values")
            }
            DecodeWarning::DefaultedMetadata {
                segment_number,
                defaulted,
            } => format!("Segment {segment_number} was missing {defaulted:?}; defaults were used"),
            DecodeWarning::OverlapCollapsed {
                frame_index,
                pixels,
            } => format!(
                "{pixels} overlapping pixels on frame {frame_index} were assigned to the last segment"
            ),
        }
    }
}
