use dicom::{
    core::VR,
    object::{FileMetaTableBuilder, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use rayon::prelude::*;
use tracing::{debug, info};

use super::{
    CodecEncodeError, RECOMMENDED_DISPLAY_CIELAB_VALUE, SEGMENT_LABEL_FALLBACK_PREFIX, mask,
};
use crate::{
    catalog::CodedConcept,
    color::rgba_to_dicom_lab,
    color_lut::ColorLut,
    dataset::{put_bytes, put_sequence, put_string, put_u16, put_u16s, put_u32s},
    enums::AlgorithmType,
    segment::{Segment, SegmentNumber},
    study::StudyContext,
    uid::generate_uid,
    volume::LabelVolume,
};

/// Header values for a new segmentation object. Unset fields fall back to
/// the volume's own series metadata, then to defaults derived from the study.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesOptions {
    pub description: Option<String>,
    pub series_number: Option<i32>,
    pub manufacturer: Option<String>,
    pub image_comments: Option<String>,
    pub content_label: Option<String>,
}

/// A freshly encoded segmentation and the identifiers it was given.
#[derive(Debug, Clone)]
pub struct EncodedSegmentation {
    pub dataset: InMemDicomObject,
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub series_description: String,
    pub series_number: i32,
    /// Mask planes written to the object.
    pub frame_count: usize,
    pub segment_numbers: Vec<SegmentNumber>,
}

impl EncodedSegmentation {
    /// Part 10 file bytes (preamble, file meta group, explicit VR little
    /// endian data set).
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecEncodeError> {
        let file_object = self
            .dataset
            .clone()
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(uids::SEGMENTATION_STORAGE)
                    .media_storage_sop_instance_uid(self.sop_instance_uid.as_str())
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
            )
            .map_err(|err| CodecEncodeError::Write(err.to_string()))?;

        let mut bytes = Vec::new();
        file_object
            .write_all(&mut bytes)
            .map_err(|err| CodecEncodeError::Write(err.to_string()))?;
        Ok(bytes)
    }
}

struct MaskPlane {
    frame: usize,
    segment_number: SegmentNumber,
    mask: Vec<bool>,
}

pub struct SegEncoder;

impl SegEncoder {
    /// Encode a label volume as a binary DICOM Segmentation
    ///
    /// # Arguments
    ///
    /// * `volume` - Label volume with its segments and reference frames
    /// * `lut` - Colors for segments without a persisted color
    /// * `study` - Study the new series joins
    /// * `options` - Explicit header values
    ///
    /// # Errors
    ///
    /// Returns error if the volume has no reference frames or its frames
    /// differ in size
    pub fn encode(
        volume: &LabelVolume,
        lut: &ColorLut,
        study: &StudyContext,
        options: &SeriesOptions,
    ) -> Result<EncodedSegmentation, CodecEncodeError> {
        let frames = volume.reference_frames();
        let (rows, columns) = match frames.first() {
            Some(first) => (first.rows, first.columns),
            None => return Err(CodecEncodeError::NoReferenceFrames),
        };
        if frames.iter().any(|f| (f.rows, f.columns) != (rows, columns)) {
            return Err(CodecEncodeError::InconsistentDimensions);
        }

        let (Ok(dicom_rows), Ok(dicom_columns)) = (u16::try_from(rows), u16::try_from(columns))
        else {
            return Err(CodecEncodeError::FrameTooLarge { rows, columns });
        };

        let segment_numbers: Vec<SegmentNumber> =
            volume.referenced_segments().into_iter().collect();
        let mut planes = Self::collect_planes(volume);
        if planes.len() > i32::MAX as usize {
            return Err(CodecEncodeError::TooManyFrames(planes.len()));
        }
        if let (true, Some(&segment_number)) = (planes.is_empty(), segment_numbers.first()) {
            // Segments exist but nothing is painted: one blank plane keeps the
            // object valid and the segment records decodable.
            planes.push(MaskPlane {
                frame: 0,
                segment_number,
                mask: vec![false; frames[0].pixel_count()],
            });
        }

        let metadata = &volume.series_metadata;
        let series_description = options
            .description
            .clone()
            .or_else(|| metadata.description.clone())
            .unwrap_or_else(|| study.next_segmentation_description());
        let series_number = options
            .series_number
            .or(metadata.series_number)
            .unwrap_or_else(|| study.next_series_number());
        let sop_instance_uid = metadata
            .sop_instance_uid
            .clone()
            .unwrap_or_else(generate_uid);
        let series_instance_uid = metadata
            .series_instance_uid
            .clone()
            .unwrap_or_else(generate_uid);

        let mut dataset = InMemDicomObject::new_empty();
        put_string(&mut dataset, tags::SOP_CLASS_UID, VR::UI, uids::SEGMENTATION_STORAGE);
        put_string(&mut dataset, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str());
        put_string(
            &mut dataset,
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            study.study_instance_uid.as_str(),
        );
        put_string(&mut dataset, tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid.as_str());
        if let Some(frame_of_reference) = &study.frame_of_reference_uid {
            put_string(
                &mut dataset,
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                frame_of_reference.as_str(),
            );
        }
        if let Some(patient_name) = &study.patient_name {
            put_string(&mut dataset, tags::PATIENT_NAME, VR::PN, patient_name.as_str());
        }
        if let Some(patient_id) = &study.patient_id {
            put_string(&mut dataset, tags::PATIENT_ID, VR::LO, patient_id.as_str());
        }
        put_string(&mut dataset, tags::MODALITY, VR::CS, "SEG");
        put_string(&mut dataset, tags::SERIES_DESCRIPTION, VR::LO, series_description.as_str());
        put_string(&mut dataset, tags::SERIES_NUMBER, VR::IS, series_number.to_string());
        put_string(&mut dataset, tags::INSTANCE_NUMBER, VR::IS, "1");
        if let Some(manufacturer) = options
            .manufacturer
            .as_ref()
            .or(metadata.manufacturer.as_ref())
        {
            put_string(&mut dataset, tags::MANUFACTURER, VR::LO, manufacturer.as_str());
        }
        if let Some(comments) = options.image_comments.as_ref().or(metadata.comment.as_ref()) {
            put_string(&mut dataset, tags::IMAGE_COMMENTS, VR::LT, comments.as_str());
        }
        put_string(&mut dataset, tags::IMAGE_TYPE, VR::CS, "DERIVED\\PRIMARY");
        put_string(
            &mut dataset,
            tags::CONTENT_LABEL,
            VR::CS,
            options.content_label.as_deref().unwrap_or("SEGMENTATION"),
        );
        put_string(&mut dataset, tags::SEGMENTATION_TYPE, VR::CS, "BINARY");
        put_string(&mut dataset, tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00");

        put_u16(&mut dataset, tags::SAMPLES_PER_PIXEL, 1);
        put_string(&mut dataset, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
        put_u16(&mut dataset, tags::ROWS, dicom_rows);
        put_u16(&mut dataset, tags::COLUMNS, dicom_columns);
        put_u16(&mut dataset, tags::BITS_ALLOCATED, 1);
        put_u16(&mut dataset, tags::BITS_STORED, 1);
        put_u16(&mut dataset, tags::HIGH_BIT, 0);
        put_u16(&mut dataset, tags::PIXEL_REPRESENTATION, 0);
        put_string(&mut dataset, tags::NUMBER_OF_FRAMES, VR::IS, planes.len().to_string());

        let segment_items = segment_numbers
            .iter()
            .map(|&number| {
                let segment = volume
                    .registry()
                    .get(number)
                    .cloned()
                    .unwrap_or_else(|| Self::placeholder_segment(number));
                Self::segment_item(&segment, lut)
            })
            .collect();
        put_sequence(&mut dataset, tags::SEGMENT_SEQUENCE, segment_items);

        let frame_items = planes
            .iter()
            .map(|plane| Self::frame_item(volume, plane))
            .collect();
        put_sequence(&mut dataset, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, frame_items);

        let masks: Vec<Vec<bool>> = planes.into_iter().map(|plane| plane.mask).collect();
        let frame_count = masks.len();
        put_bytes(&mut dataset, tags::PIXEL_DATA, VR::OB, mask::pack_frames(&masks));

        info!(
            volume = volume.index(),
            frames = frame_count,
            segments = segment_numbers.len(),
            series_number,
            "encoded segmentation"
        );

        Ok(EncodedSegmentation {
            dataset,
            sop_instance_uid,
            series_instance_uid,
            series_description,
            series_number,
            frame_count,
            segment_numbers,
        })
    }

    /// Mask planes ordered by frame, then by segment number.
    fn collect_planes(volume: &LabelVolume) -> Vec<MaskPlane> {
        volume
            .slices()
            .par_iter()
            .enumerate()
            .flat_map_iter(|(frame, slice)| {
                slice.iter().flat_map(move |slice| {
                    slice
                        .scan_segments()
                        .into_iter()
                        .map(move |segment_number| MaskPlane {
                            frame,
                            segment_number,
                            mask: slice.mask(segment_number),
                        })
                })
            })
            .collect()
    }

    /// Stand-in for a segment that is painted but was never registered.
    fn placeholder_segment(number: SegmentNumber) -> Segment {
        debug!(number, "encoding unregistered segment with placeholder metadata");
        Segment {
            label: format!("{SEGMENT_LABEL_FALLBACK_PREFIX} {number}"),
            category: Some(CodedConcept::other()),
            property_type: Some(CodedConcept::other()),
            algorithm_type: AlgorithmType::SemiAutomatic,
            algorithm_name: Some("unknown".to_string()),
            ..Segment::unlabeled(number)
        }
    }

    fn code_item(concept: &CodedConcept) -> InMemDicomObject {
        let mut item = InMemDicomObject::new_empty();
        put_string(&mut item, tags::CODE_VALUE, VR::SH, concept.code.as_str());
        put_string(&mut item, tags::CODING_SCHEME_DESIGNATOR, VR::SH, concept.scheme.as_str());
        put_string(&mut item, tags::CODE_MEANING, VR::LO, concept.meaning.as_str());
        item
    }

    fn segment_item(segment: &Segment, lut: &ColorLut) -> InMemDicomObject {
        let mut item = InMemDicomObject::new_empty();
        put_u16(&mut item, tags::SEGMENT_NUMBER, segment.number);
        put_string(&mut item, tags::SEGMENT_LABEL, VR::LO, segment.label.as_str());
        put_string(
            &mut item,
            tags::SEGMENT_ALGORITHM_TYPE,
            VR::CS,
            segment.algorithm_type.as_dicom_str(),
        );
        match &segment.algorithm_name {
            Some(name) => {
                put_string(&mut item, tags::SEGMENT_ALGORITHM_NAME, VR::LO, name.as_str())
            }
            None if segment.algorithm_type.requires_name() => {
                put_string(&mut item, tags::SEGMENT_ALGORITHM_NAME, VR::LO, "unknown")
            }
            None => {}
        }

        // Category and type are mandatory in the Segment Sequence
        let other = CodedConcept::other();
        let category = segment.category.as_ref().unwrap_or(&other);
        let property_type = segment.property_type.as_ref().unwrap_or(&other);
        put_sequence(
            &mut item,
            tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE,
            vec![Self::code_item(category)],
        );
        let mut type_item = Self::code_item(property_type);
        if let Some(modifier) = &segment.modifier {
            put_sequence(
                &mut type_item,
                tags::SEGMENTED_PROPERTY_TYPE_MODIFIER_CODE_SEQUENCE,
                vec![Self::code_item(modifier)],
            );
        }
        put_sequence(&mut item, tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE, vec![type_item]);

        let color = segment
            .display_color
            .unwrap_or_else(|| rgba_to_dicom_lab(lut.color(segment.number)));
        put_u16s(&mut item, RECOMMENDED_DISPLAY_CIELAB_VALUE, &color);
        item
    }

    fn frame_item(volume: &LabelVolume, plane: &MaskPlane) -> InMemDicomObject {
        let reference = &volume.reference_frames()[plane.frame];

        let mut source = InMemDicomObject::new_empty();
        if !reference.sop_class_uid.is_empty() {
            put_string(
                &mut source,
                tags::REFERENCED_SOP_CLASS_UID,
                VR::UI,
                reference.sop_class_uid.as_str(),
            );
        }
        put_string(
            &mut source,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            reference.frame_id.as_str(),
        );
        let mut derivation = InMemDicomObject::new_empty();
        put_sequence(&mut derivation, tags::SOURCE_IMAGE_SEQUENCE, vec![source]);

        let mut frame_content = InMemDicomObject::new_empty();
        put_u32s(
            &mut frame_content,
            tags::DIMENSION_INDEX_VALUES,
            &[u32::from(plane.segment_number), (plane.frame + 1) as u32],
        );

        let mut identification = InMemDicomObject::new_empty();
        put_u16(&mut identification, tags::REFERENCED_SEGMENT_NUMBER, plane.segment_number);

        let mut item = InMemDicomObject::new_empty();
        put_sequence(&mut item, tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation]);
        put_sequence(&mut item, tags::FRAME_CONTENT_SEQUENCE, vec![frame_content]);
        put_sequence(&mut item, tags::SEGMENT_IDENTIFICATION_SEQUENCE, vec![identification]);
        item
    }
}
