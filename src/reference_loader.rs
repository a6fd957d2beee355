use crate::{
    dataset::{read_i32, read_string, read_u32},
    enums::SortBy,
    study::{StudyContext, StudySeries},
};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReferenceLoadError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Series {0} is not part of the loaded study")]
    UnknownSeries(String),

    #[error("Reference frame {frame_id} has no pixel dimensions")]
    UnresolvedFrame { frame_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// One image of the reference stack a label volume is drawn on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceFrame {
    /// SOP Instance UID of the referenced image.
    pub frame_id: String,
    pub sop_class_uid: String,
    pub rows: u32,
    pub columns: u32,
}

impl ReferenceFrame {
    pub fn new(frame_id: impl Into<String>, rows: u32, columns: u32) -> Self {
        Self {
            frame_id: frame_id.into(),
            sop_class_uid: String::new(),
            rows,
            columns,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// (rows, columns) as used for slice buffers.
    pub fn dim(&self) -> (usize, usize) {
        (self.rows as usize, self.columns as usize)
    }
}

/// Supplies the ordered reference frames of a series. Hosts typically fetch
/// them over the network, so resolution is asynchronous.
pub trait ReferenceResolver {
    fn resolve_frames<'a>(
        &'a self,
        series_id: &'a str,
    ) -> LocalBoxFuture<'a, Result<Vec<ReferenceFrame>, ReferenceLoadError>>;
}

/// Reference frames of every image series found in a set of DICOM objects,
/// together with the study they belong to.
#[derive(Debug, Clone, Default)]
pub struct LoadedStudy {
    pub study: StudyContext,
    pub frames_by_series: BTreeMap<String, Vec<ReferenceFrame>>,
}

impl LoadedStudy {
    pub fn frames(&self, series_id: &str) -> Result<Vec<ReferenceFrame>, ReferenceLoadError> {
        self.frames_by_series
            .get(series_id)
            .cloned()
            .ok_or_else(|| ReferenceLoadError::UnknownSeries(series_id.to_string()))
    }

    /// Series UIDs with at least one image frame.
    pub fn image_series(&self) -> impl Iterator<Item = &str> {
        self.frames_by_series.keys().map(String::as_str)
    }
}

impl ReferenceResolver for LoadedStudy {
    fn resolve_frames<'a>(
        &'a self,
        series_id: &'a str,
    ) -> LocalBoxFuture<'a, Result<Vec<ReferenceFrame>, ReferenceLoadError>> {
        future::ready(self.frames(series_id)).boxed_local()
    }
}

pub struct ReferenceLoader;

impl ReferenceLoader {
    /// Group DICOM objects into series and order each series' frames
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the frames within a series
    ///
    /// Objects without pixel dimensions (and existing segmentations) still
    /// count as series of the study but contribute no frames.
    ///
    /// # Errors
    ///
    /// Returns error if no image frame was found
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<LoadedStudy, ReferenceLoadError> {
        let mut loaded = LoadedStudy::default();
        let mut frames_with_order: BTreeMap<String, Vec<(Option<f32>, ReferenceFrame)>> =
            BTreeMap::new();

        for dicom_object in dicom_objects {
            let Some(series_uid) = read_string(dicom_object, tags::SERIES_INSTANCE_UID) else {
                continue;
            };
            let modality = read_string(dicom_object, tags::MODALITY).unwrap_or_default();
            Self::record_study(&mut loaded.study, dicom_object, &series_uid, &modality);

            if modality.eq_ignore_ascii_case("SEG") {
                continue;
            }
            if let Some(entry) = Self::extract_frame_with_order(dicom_object, &sort_by) {
                frames_with_order.entry(series_uid).or_default().push(entry);
            }
        }

        if frames_with_order.is_empty() {
            return Err(ReferenceLoadError::NoValidImages);
        }

        for (series_uid, mut frames) in frames_with_order {
            Self::sort_frames(&mut frames, &sort_by);
            debug!(series = %series_uid, frames = frames.len(), "resolved reference series");
            loaded
                .frames_by_series
                .insert(series_uid, frames.into_iter().map(|(_, frame)| frame).collect());
        }

        info!(
            study = %loaded.study.study_instance_uid,
            series = loaded.study.series.len(),
            "loaded reference study"
        );
        Ok(loaded)
    }

    /// Load from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
        sort_by: SortBy,
    ) -> Result<LoadedStudy, ReferenceLoadError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<LoadedStudy, ReferenceLoadError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(ReferenceLoadError::NoValidImages);
        }

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn record_study(
        study: &mut StudyContext,
        dicom_object: &InMemDicomObject,
        series_uid: &str,
        modality: &str,
    ) {
        if study.study_instance_uid.is_empty() {
            study.study_instance_uid =
                read_string(dicom_object, tags::STUDY_INSTANCE_UID).unwrap_or_default();
            study.patient_name = read_string(dicom_object, tags::PATIENT_NAME);
            study.patient_id = read_string(dicom_object, tags::PATIENT_ID);
        }
        if study.frame_of_reference_uid.is_none() {
            study.frame_of_reference_uid = read_string(dicom_object, tags::FRAME_OF_REFERENCE_UID);
        }
        if !study
            .series
            .iter()
            .any(|s| s.series_instance_uid == series_uid)
        {
            study.series.push(StudySeries {
                series_instance_uid: series_uid.to_string(),
                modality: modality.to_string(),
                series_number: read_i32(dicom_object, tags::SERIES_NUMBER),
            });
        }
    }

    fn extract_frame_with_order(
        dicom_object: &InMemDicomObject,
        sort_by: &SortBy,
    ) -> Option<(Option<f32>, ReferenceFrame)> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let frame = ReferenceFrame {
            frame_id: read_string(dicom_object, tags::SOP_INSTANCE_UID)?,
            sop_class_uid: read_string(dicom_object, tags::SOP_CLASS_UID).unwrap_or_default(),
            rows: read_u32(dicom_object, tags::ROWS)?,
            columns: read_u32(dicom_object, tags::COLUMNS)?,
        };
        Some((order, frame))
    }

    fn get_sort_order(dicom_object: &InMemDicomObject, sort_by: &SortBy) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                Some(pos.get(2).copied())
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = read_i32(dicom_object, tags::INSTANCE_NUMBER).map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn sort_frames(frames_with_order: &mut [(Option<f32>, ReferenceFrame)], sort_by: &SortBy) {
        if !matches!(sort_by, SortBy::None) {
            frames_with_order
                .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            frames_with_order.reverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::put_string;
    use dicom::core::VR;
    use dicom::object::FileMetaTableBuilder;
    use dicom_dictionary_std::uids;

    fn image(
        series: &str,
        sop: &str,
        instance: i32,
        modality: &str,
    ) -> FileDicomObject<InMemDicomObject> {
        let mut object = InMemDicomObject::new_empty();
        put_string(&mut object, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");
        put_string(&mut object, tags::SERIES_INSTANCE_UID, VR::UI, series);
        put_string(&mut object, tags::SOP_INSTANCE_UID, VR::UI, sop);
        put_string(&mut object, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
        put_string(&mut object, tags::MODALITY, VR::CS, modality);
        put_string(&mut object, tags::SERIES_NUMBER, VR::IS, "3");
        put_string(&mut object, tags::INSTANCE_NUMBER, VR::IS, instance.to_string());
        crate::dataset::put_u16(&mut object, tags::ROWS, 4);
        crate::dataset::put_u16(&mut object, tags::COLUMNS, 5);
        object
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(sop)
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
            )
            .unwrap()
    }

    #[test]
    fn frames_are_sorted_by_instance_number() {
        let objects = vec![
            image("1.2.3.1", "1.2.3.1.2", 2, "CT"),
            image("1.2.3.1", "1.2.3.1.1", 1, "CT"),
            image("1.2.3.1", "1.2.3.1.3", 3, "CT"),
        ];
        let loaded =
            ReferenceLoader::load_from_dicom_objects(&objects, SortBy::InstanceNumber).unwrap();
        let frames = loaded.frames("1.2.3.1").unwrap();
        let ids: Vec<_> = frames.iter().map(|f| f.frame_id.as_str()).collect();
        assert_eq!(ids, ["1.2.3.1.1", "1.2.3.1.2", "1.2.3.1.3"]);
        assert_eq!(frames[0].pixel_count(), 20);
        assert_eq!(loaded.study.study_instance_uid, "1.2.3");
    }

    #[test]
    fn segmentations_count_as_series_without_frames() {
        let objects = vec![
            image("1.2.3.1", "1.2.3.1.1", 1, "CT"),
            image("1.2.3.9", "1.2.3.9.1", 1, "SEG"),
        ];
        let loaded =
            ReferenceLoader::load_from_dicom_objects(&objects, SortBy::InstanceNumber).unwrap();
        assert_eq!(loaded.study.series.len(), 2);
        assert_eq!(loaded.study.segmentation_series_count(), 1);
        assert_eq!(loaded.image_series().collect::<Vec<_>>(), ["1.2.3.1"]);
        assert!(matches!(
            loaded.frames("1.2.3.9"),
            Err(ReferenceLoadError::UnknownSeries(_))
        ));
    }

    #[test]
    fn no_images_is_an_error() {
        let objects = vec![image("1.2.3.9", "1.2.3.9.1", 1, "SEG")];
        assert!(matches!(
            ReferenceLoader::load_from_dicom_objects(&objects, SortBy::None),
            Err(ReferenceLoadError::NoValidImages)
        ));
    }

    #[tokio::test]
    async fn loaded_study_resolves_frames() {
        let objects = vec![image("1.2.3.1", "1.2.3.1.1", 1, "CT")];
        let loaded = ReferenceLoader::load_from_dicom_objects(&objects, SortBy::None).unwrap();
        let frames = loaded.resolve_frames("1.2.3.1").await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sop_class_uid, uids::CT_IMAGE_STORAGE);
    }
}
