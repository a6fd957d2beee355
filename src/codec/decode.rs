use std::{
    borrow::Cow,
    collections::{BTreeSet, HashMap},
};

use dicom::object::{InMemDicomObject, from_reader};
use dicom_dictionary_std::{tags, uids};
use image::Rgba;
use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{
    CodecDecodeError, DecodeWarning, DefaultedField, RECOMMENDED_DISPLAY_CIELAB_VALUE,
    ROI_DISPLAY_COLOR, mask,
};
use crate::{
    catalog::{CodedConcept, CodingCatalog},
    color::{DicomLab, Palette, rgba_to_dicom_lab},
    color_lut::ColorLut,
    dataset::{first_item, read_i32, read_items, read_string, read_u16s, read_u32},
    enums::AlgorithmType,
    reference_loader::ReferenceFrame,
    segment::{BACKGROUND, DEFAULT_LABEL, Segment, SegmentNumber, SegmentRegistry},
    volume::{LabelSlice, SeriesMetadata},
};

/// Which lookup table a decoded volume should render with.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedColors {
    /// No segment carried a color: use the shared default table.
    SharedDefault,
    /// A dedicated table built from the persisted colors.
    Custom(ColorLut),
}

/// Everything needed to install a decoded segmentation as a label volume.
#[derive(Debug, Clone)]
pub struct DecodedSegmentation {
    pub reference_frames: Vec<ReferenceFrame>,
    /// One entry per reference frame, `None` where nothing is labelled.
    pub slices: Vec<Option<LabelSlice>>,
    pub registry: SegmentRegistry,
    pub colors: DecodedColors,
    pub series_metadata: SeriesMetadata,
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedSegmentation {
    pub fn frame_ids(&self) -> Vec<String> {
        self.reference_frames
            .iter()
            .map(|f| f.frame_id.clone())
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.registry.len()
    }
}

/// One parsed Segment Sequence item.
struct SegmentRecord {
    segment: Segment,
    defaulted: Vec<DefaultedField>,
}

/// Where one mask plane lands.
#[derive(Debug, Clone, Copy)]
struct PlaneTarget {
    frame: usize,
    segment_number: SegmentNumber,
}

pub struct SegDecoder;

impl SegDecoder {
    /// Decode Part 10 bytes, with or without the 128 byte preamble.
    pub fn decode_bytes(
        bytes: &[u8],
        reference_frames: Vec<ReferenceFrame>,
        catalog: &CodingCatalog,
        palette: Palette,
    ) -> Result<DecodedSegmentation, CodecDecodeError> {
        let body = match bytes.get(128..132) {
            Some(magic) if magic == b"DICM" => &bytes[128..],
            _ => bytes,
        };
        let object = from_reader(body)?;
        Self::decode(&object, reference_frames, catalog, palette)
    }

    /// Decode a DICOM Segmentation against the frames of its reference series
    ///
    /// # Arguments
    ///
    /// * `object` - Segmentation data set
    /// * `reference_frames` - Ordered frames of the referenced series
    /// * `catalog` - Coding catalog the segment codes are checked against
    /// * `palette` - Fallback colors for segments without a persisted color
    ///
    /// # Errors
    ///
    /// Returns error if the object is not a segmentation or its mask planes
    /// cannot be placed on the reference frames
    pub fn decode(
        object: &InMemDicomObject,
        reference_frames: Vec<ReferenceFrame>,
        catalog: &CodingCatalog,
        palette: Palette,
    ) -> Result<DecodedSegmentation, CodecDecodeError> {
        Self::check_sop_class(object)?;
        if reference_frames.is_empty() {
            return Err(CodecDecodeError::NoReferenceFrames);
        }

        let rows = read_u32(object, tags::ROWS).ok_or(CodecDecodeError::MissingAttribute("Rows"))?;
        let columns =
            read_u32(object, tags::COLUMNS).ok_or(CodecDecodeError::MissingAttribute("Columns"))?;
        let bits_allocated = read_i32(object, tags::BITS_ALLOCATED).unwrap_or(1) as u16;
        if bits_allocated != 1 && bits_allocated != 8 {
            return Err(CodecDecodeError::UnsupportedBitsAllocated(bits_allocated));
        }

        let mut warnings = Vec::new();
        let records = Self::read_segment_records(object);
        let record_numbers: Vec<SegmentNumber> =
            records.iter().map(|r| r.segment.number).collect();

        let targets = Self::plane_targets(object, &reference_frames, &record_numbers)?;
        for target in &targets {
            let frame = &reference_frames[target.frame];
            if (frame.rows, frame.columns) != (rows, columns) {
                return Err(CodecDecodeError::DimensionMismatch {
                    frame_id: frame.frame_id.clone(),
                    expected: (frame.rows, frame.columns),
                    actual: (rows, columns),
                });
            }
        }

        let pixel_data: Cow<'_, [u8]> = if targets.is_empty() {
            Cow::Borrowed(&[])
        } else {
            object
                .get(tags::PIXEL_DATA)
                .ok_or(CodecDecodeError::MissingAttribute("PixelData"))?
                .to_bytes()
                .map_err(|_| CodecDecodeError::MissingAttribute("PixelData"))?
        };
        let pixels_per_frame = rows as usize * columns as usize;
        let expected = match bits_allocated {
            1 => mask::required_len(targets.len(), pixels_per_frame),
            _ => targets.len() * pixels_per_frame,
        };
        if pixel_data.len() < expected {
            return Err(CodecDecodeError::TruncatedPixelData {
                expected,
                actual: pixel_data.len(),
            });
        }

        let plane_pixels: Vec<Vec<usize>> = (0..targets.len())
            .into_par_iter()
            .map(|plane| match bits_allocated {
                1 => mask::set_pixels(&pixel_data, plane, pixels_per_frame),
                _ => mask::set_pixels_8bit(&pixel_data, plane, pixels_per_frame),
            })
            .collect();

        let mut buffers: Vec<Option<Array2<u16>>> = vec![None; reference_frames.len()];
        let mut overlaps = vec![0usize; reference_frames.len()];
        for (target, pixels) in targets.iter().zip(&plane_pixels) {
            if pixels.is_empty() {
                continue;
            }
            let buffer = buffers[target.frame]
                .get_or_insert_with(|| Array2::zeros((rows as usize, columns as usize)));
            for &pixel in pixels {
                let value = &mut buffer[(pixel / columns as usize, pixel % columns as usize)];
                if *value != BACKGROUND && *value != target.segment_number {
                    overlaps[target.frame] += 1;
                }
                *value = target.segment_number;
            }
        }
        for (frame_index, &pixels) in overlaps.iter().enumerate() {
            if pixels > 0 {
                warn!(frame_index, pixels, "overlapping segments collapsed");
                warnings.push(DecodeWarning::OverlapCollapsed {
                    frame_index,
                    pixels,
                });
            }
        }
        let mut slices: Vec<Option<LabelSlice>> = buffers
            .into_iter()
            .map(|buffer| buffer.map(LabelSlice::from_pixels))
            .collect();

        let registry = Self::build_registry(records, &slices, catalog, &mut warnings);

        // Segments with metadata but no pixels still show up in listings.
        let painted: BTreeSet<SegmentNumber> = slices
            .iter()
            .flatten()
            .flat_map(|slice| slice.segments_present().iter().copied())
            .collect();
        let first = slices.iter().position(Option::is_some).unwrap_or(0);
        for number in registry.numbers().filter(|n| !painted.contains(n)) {
            let (rows, columns) = reference_frames[first].dim();
            slices[first]
                .get_or_insert_with(|| LabelSlice::new(rows, columns))
                .list_segment(number);
        }

        let colors = Self::build_colors(&registry, palette);
        let series_metadata = Self::read_series_metadata(object);

        info!(
            frames = targets.len(),
            segments = registry.len(),
            warnings = warnings.len(),
            "decoded segmentation"
        );

        Ok(DecodedSegmentation {
            reference_frames,
            slices,
            registry,
            colors,
            series_metadata,
            warnings,
        })
    }

    fn check_sop_class(object: &InMemDicomObject) -> Result<(), CodecDecodeError> {
        let sop_class = read_string(object, tags::SOP_CLASS_UID);
        let modality = read_string(object, tags::MODALITY);
        let is_seg = sop_class.as_deref() == Some(uids::SEGMENTATION_STORAGE)
            || modality.is_some_and(|m| m.eq_ignore_ascii_case("SEG"));
        if is_seg {
            Ok(())
        } else {
            Err(CodecDecodeError::NotASegmentation)
        }
    }

    fn read_code(item: Option<&InMemDicomObject>) -> Option<CodedConcept> {
        let item = item?;
        let code = read_string(item, tags::CODE_VALUE)?;
        Some(CodedConcept::new(
            code,
            read_string(item, tags::CODING_SCHEME_DESIGNATOR).unwrap_or_default(),
            read_string(item, tags::CODE_MEANING).unwrap_or_default(),
        ))
    }

    fn read_color(item: &InMemDicomObject) -> Option<DicomLab> {
        if let Some(lab) = read_u16s(item, RECOMMENDED_DISPLAY_CIELAB_VALUE)
            && let [l, a, b] = lab[..]
        {
            return Some([l, a, b]);
        }
        let rgb = read_u16s(item, ROI_DISPLAY_COLOR)?;
        match rgb[..] {
            [r, g, b] => Some(rgba_to_dicom_lab(Rgba([
                r.min(255) as u8,
                g.min(255) as u8,
                b.min(255) as u8,
                255,
            ]))),
            _ => None,
        }
    }

    fn read_segment_records(object: &InMemDicomObject) -> Vec<SegmentRecord> {
        let mut records = Vec::new();
        for item in read_items(object, tags::SEGMENT_SEQUENCE) {
            let number = match read_u32(item, tags::SEGMENT_NUMBER) {
                Some(n) if n != 0 && n <= u32::from(u16::MAX) => n as SegmentNumber,
                other => {
                    warn!(number = ?other, "skipping segment item with invalid number");
                    continue;
                }
            };

            let mut defaulted = Vec::new();
            let label = read_string(item, tags::SEGMENT_LABEL).unwrap_or_else(|| {
                defaulted.push(DefaultedField::Label);
                DEFAULT_LABEL.to_string()
            });
            let category =
                Self::read_code(first_item(item, tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE));
            if category.is_none() {
                defaulted.push(DefaultedField::Category);
            }
            let type_item = first_item(item, tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE);
            let property_type = Self::read_code(type_item);
            if property_type.is_none() {
                defaulted.push(DefaultedField::PropertyType);
            }
            let modifier = type_item.and_then(|type_item| {
                Self::read_code(first_item(
                    type_item,
                    tags::SEGMENTED_PROPERTY_TYPE_MODIFIER_CODE_SEQUENCE,
                ))
            });

            let algorithm_type = read_string(item, tags::SEGMENT_ALGORITHM_TYPE)
                .and_then(|value| AlgorithmType::from_dicom_str(&value))
                .unwrap_or_default();
            let mut algorithm_name = read_string(item, tags::SEGMENT_ALGORITHM_NAME);
            if algorithm_type.requires_name() && algorithm_name.is_none() {
                defaulted.push(DefaultedField::AlgorithmName);
                algorithm_name = Some("unknown".to_string());
            }

            records.push(SegmentRecord {
                segment: Segment {
                    number,
                    label,
                    category,
                    property_type,
                    modifier,
                    algorithm_type,
                    algorithm_name,
                    display_color: Self::read_color(item),
                    visible: true,
                },
                defaulted,
            });
        }
        records
    }

    /// Frame and segment of every mask plane, in pixel data order.
    fn plane_targets(
        object: &InMemDicomObject,
        reference_frames: &[ReferenceFrame],
        record_numbers: &[SegmentNumber],
    ) -> Result<Vec<PlaneTarget>, CodecDecodeError> {
        let per_frame = read_items(object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);
        let plane_count = if per_frame.is_empty() {
            read_i32(object, tags::NUMBER_OF_FRAMES).unwrap_or(1).max(0) as usize
        } else {
            per_frame.len()
        };
        if plane_count == 0 {
            // Nothing painted: the segment records alone describe the volume.
            return Ok(Vec::new());
        }

        let referenced: Option<Vec<(String, SegmentNumber)>> = (!per_frame.is_empty())
            .then(|| {
                per_frame
                    .iter()
                    .map(|item| {
                        let uid = first_item(item, tags::DERIVATION_IMAGE_SEQUENCE)
                            .and_then(|d| first_item(d, tags::SOURCE_IMAGE_SEQUENCE))
                            .and_then(|s| read_string(s, tags::REFERENCED_SOP_INSTANCE_UID))?;
                        let number = first_item(item, tags::SEGMENT_IDENTIFICATION_SEQUENCE)
                            .and_then(|s| read_u32(s, tags::REFERENCED_SEGMENT_NUMBER))?;
                        Some((uid, u16::try_from(number).ok()?))
                    })
                    .collect()
            })
            .flatten();

        if let Some(referenced) = referenced {
            let by_uid: HashMap<&str, usize> = reference_frames
                .iter()
                .enumerate()
                .map(|(index, frame)| (frame.frame_id.as_str(), index))
                .collect();
            return referenced
                .into_iter()
                .map(|(uid, segment_number)| match by_uid.get(uid.as_str()) {
                    Some(&frame) => Ok(PlaneTarget {
                        frame,
                        segment_number,
                    }),
                    None => Err(CodecDecodeError::UnknownReferencedFrame { uid }),
                })
                .collect();
        }

        // Without per-frame references, planes are segment-major over every
        // reference frame.
        let frame_count = reference_frames.len();
        if record_numbers.is_empty() || plane_count != record_numbers.len() * frame_count {
            return Err(CodecDecodeError::FrameCountMismatch {
                planes: plane_count,
                reference_frames: frame_count,
                segments: record_numbers.len(),
            });
        }
        debug!(planes = plane_count, "mapping planes by position");
        Ok((0..plane_count)
            .map(|plane| PlaneTarget {
                frame: plane % frame_count,
                segment_number: record_numbers[plane / frame_count],
            })
            .collect())
    }

    fn build_registry(
        records: Vec<SegmentRecord>,
        slices: &[Option<LabelSlice>],
        catalog: &CodingCatalog,
        warnings: &mut Vec<DecodeWarning>,
    ) -> SegmentRegistry {
        let mut registry = SegmentRegistry::new();

        for SegmentRecord { segment, defaulted } in records {
            let number = segment.number;
            let found = catalog.match_codes(
                segment.category.as_ref(),
                segment.property_type.as_ref(),
                segment.modifier.as_ref(),
            );
            if !found.unmatched.is_empty() {
                warnings.push(DecodeWarning::UnmatchedMetadata {
                    segment_number: number,
                    unmatched: found.unmatched,
                });
            }
            if !defaulted.is_empty() {
                warnings.push(DecodeWarning::DefaultedMetadata {
                    segment_number: number,
                    defaulted,
                });
            }
            if let Err(err) = registry.insert(segment) {
                warn!(number, %err, "segment metadata rejected");
            }
        }

        let painted: BTreeSet<SegmentNumber> = slices
            .iter()
            .flatten()
            .flat_map(|slice| slice.segments_present().iter().copied())
            .collect();
        for number in painted {
            if registry.contains(number) {
                continue;
            }
            if registry.ensure_default(number).is_ok() {
                warnings.push(DecodeWarning::DefaultedMetadata {
                    segment_number: number,
                    defaulted: vec![DefaultedField::Record],
                });
            }
        }

        registry
    }

    fn build_colors(registry: &SegmentRegistry, palette: Palette) -> DecodedColors {
        let mut colored = registry
            .iter()
            .filter_map(|s| s.display_color.map(|c| (s.number, c)))
            .peekable();
        if colored.peek().is_none() {
            return DecodedColors::SharedDefault;
        }
        let mut lut = ColorLut::from_palette(palette);
        for (number, color) in colored {
            lut.set_dicom_lab(number, color);
        }
        DecodedColors::Custom(lut)
    }

    fn read_series_metadata(object: &InMemDicomObject) -> SeriesMetadata {
        SeriesMetadata {
            description: read_string(object, tags::SERIES_DESCRIPTION),
            series_number: read_i32(object, tags::SERIES_NUMBER),
            manufacturer: read_string(object, tags::MANUFACTURER),
            comment: read_string(object, tags::IMAGE_COMMENTS),
            sop_instance_uid: read_string(object, tags::SOP_INSTANCE_UID),
            series_instance_uid: read_string(object, tags::SERIES_INSTANCE_UID),
        }
    }
}
