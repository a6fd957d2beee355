//! The label volume store: every volume, lookup table and subscriber of one
//! viewer session.
//!
//! All mutation goes through `&mut SegmentationSession`. Volumes live in an
//! arena addressed by [`VolumeIndex`]; a deleted volume leaves a vacant slot
//! that the next created volume takes. Each successful mutation is reported
//! through the session's [`NotificationPort`] after it has been applied.

use std::collections::BTreeSet;

use image::Rgba;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::{
    catalog::{CodedConcept, CodingCatalog},
    codec::{
        CodecDecodeError, CodecEncodeError, DecodeWarning, DecodedColors, DecodedSegmentation,
        EncodedSegmentation, SegDecoder, SegEncoder, SeriesOptions,
    },
    color::{ContrastColor, contrast_color, rgba_to_dicom_lab},
    color_lut::{ColorLut, ColorLutManager, DEFAULT_LUT_INDEX},
    config::{ConfigError, SessionConfig},
    enums::{AlgorithmType, LoadState},
    notification::{NotificationPort, SegmentationEvent, SegmentationObserver, SubscriptionId},
    reference_loader::{ReferenceFrame, ReferenceLoadError, ReferenceResolver},
    segment::{BACKGROUND, DEFAULT_LABEL, Relabel, RegistryError, Segment, SegmentNumber},
    study::StudyContext,
    volume::{LabelVolume, VolumeError, VolumeIndex},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No label volume at index {0}")]
    UnknownVolume(VolumeIndex),

    #[error("Label volume {index} is not loaded ({state:?})")]
    VolumeNotLoaded { index: VolumeIndex, state: LoadState },

    #[error("Segment number 0 is reserved for background")]
    ReservedSegment,

    #[error("Volume {volume_index} has no segment {number}")]
    UnknownSegment {
        volume_index: VolumeIndex,
        number: SegmentNumber,
    },

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    ReferenceLoad(#[from] ReferenceLoadError),

    #[error(transparent)]
    Encode(#[from] CodecEncodeError),

    #[error(transparent)]
    Decode(#[from] CodecDecodeError),
}

/// Outcome of installing a decoded segmentation.
#[derive(Debug, Clone)]
pub struct LoadedSegmentation {
    pub volume_index: VolumeIndex,
    pub warnings: Vec<DecodeWarning>,
}

/// What the host needs to store an encoded segmentation.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub study_id: String,
    /// True when the volume already exists as a stored object and the new
    /// bytes replace it.
    pub overwrite: bool,
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub bytes: Vec<u8>,
}

/// Marks a reserved volume as failed unless the load ran to completion.
struct LoadGuard<'s> {
    session: &'s mut SegmentationSession,
    index: VolumeIndex,
    settled: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.session
                .fail_load(self.index, "load was cancelled before completion");
        }
    }
}

#[derive(Debug)]
pub struct SegmentationSession {
    config: SessionConfig,
    catalog: CodingCatalog,
    luts: ColorLutManager,
    volumes: Vec<Option<LabelVolume>>,
    active_volume: Option<VolumeIndex>,
    notifications: NotificationPort,
}

impl Default for SegmentationSession {
    fn default() -> Self {
        Self::with_catalog(SessionConfig::default(), CodingCatalog::bundled())
    }
}

impl SegmentationSession {
    /// A session using the configured catalog, or the bundled one.
    ///
    /// # Errors
    ///
    /// Returns error if the configured catalog cannot be read
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        let catalog = match &config.catalog_path {
            Some(path) => CodingCatalog::from_path(path)?,
            None => CodingCatalog::bundled(),
        };
        Ok(Self::with_catalog(config, catalog))
    }

    pub fn with_catalog(config: SessionConfig, catalog: CodingCatalog) -> Self {
        Self {
            luts: ColorLutManager::new(config.palette),
            config,
            catalog,
            volumes: Vec::new(),
            active_volume: None,
            notifications: NotificationPort::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CodingCatalog {
        &self.catalog
    }

    pub fn luts(&self) -> &ColorLutManager {
        &self.luts
    }

    pub fn subscribe(
        &mut self,
        observer: impl SegmentationObserver + 'static,
    ) -> SubscriptionId {
        self.notifications.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifications.unsubscribe(id)
    }

    // Volumes

    /// The volume at `index`, in whatever load state it is.
    pub fn volume(&self, index: VolumeIndex) -> Option<&LabelVolume> {
        self.volumes.get(index).and_then(Option::as_ref)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &LabelVolume> {
        self.volumes.iter().flatten()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.iter().flatten().count()
    }

    pub fn active_volume(&self) -> Option<VolumeIndex> {
        self.active_volume
    }

    /// Lowest vacant slot, or the slot count when none is vacant.
    pub fn next_volume_index(&self) -> VolumeIndex {
        self.volumes
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.volumes.len())
    }

    fn loaded(&self, index: VolumeIndex) -> Result<&LabelVolume, SessionError> {
        let volume = self.volume(index).ok_or(SessionError::UnknownVolume(index))?;
        match volume.load_state() {
            LoadState::Loaded => Ok(volume),
            state => Err(SessionError::VolumeNotLoaded { index, state }),
        }
    }

    fn loaded_mut(&mut self, index: VolumeIndex) -> Result<&mut LabelVolume, SessionError> {
        let volume = self
            .volumes
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(SessionError::UnknownVolume(index))?;
        match volume.load_state() {
            LoadState::Loaded => Ok(volume),
            state => Err(SessionError::VolumeNotLoaded { index, state }),
        }
    }

    fn place(&mut self, volume: LabelVolume) {
        let index = volume.index();
        if index >= self.volumes.len() {
            self.volumes.resize_with(index + 1, || None);
        }
        self.volumes[index] = Some(volume);
    }

    /// Reserves the next slot with a volume that is still loading.
    fn reserve_slot(&mut self) -> VolumeIndex {
        let index = self.next_volume_index();
        self.place(LabelVolume::pending(index, DEFAULT_LUT_INDEX));
        debug!(index, "reserved label volume slot");
        index
    }

    fn fail_load(&mut self, index: VolumeIndex, reason: &str) {
        let Some(volume) = self.volumes.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        if volume.load_state() != LoadState::Loading {
            return;
        }
        volume.mark_failed();
        warn!(index, reason, "label volume failed to load");
        self.notifications.emit(SegmentationEvent::SegmentationLoadFailed {
            volume_index: index,
            reason: reason.to_string(),
        });
    }

    fn activate(&mut self, index: Option<VolumeIndex>) {
        let previous = self.active_volume;
        if previous == index {
            return;
        }
        self.active_volume = index;
        self.notifications.emit(SegmentationEvent::ActiveVolumeChanged {
            previous,
            current: index,
        });
    }

    /// Installs an empty volume over `reference_frames` at `index`, which
    /// must be vacant or reserved.
    fn install_empty(
        &mut self,
        index: VolumeIndex,
        reference_frames: Vec<ReferenceFrame>,
    ) -> Result<(), SessionError> {
        let lut_index = self.luts.next_free_lut_index();
        let volume = LabelVolume::new(index, reference_frames, lut_index)?;
        self.luts
            .set(lut_index, ColorLut::from_palette(self.config.palette));
        info!(
            index,
            frames = volume.reference_frame_count(),
            lut = lut_index,
            "created label volume"
        );
        self.place(volume);
        self.notifications.emit(SegmentationEvent::VolumeCreated { index });
        self.activate(Some(index));
        Ok(())
    }

    /// Creates an empty label volume over `reference_frames` and makes it
    /// the active volume.
    ///
    /// # Errors
    ///
    /// Returns error if there are no frames or a frame has no pixels. Nothing
    /// is created in that case.
    pub fn create_volume(
        &mut self,
        reference_frames: Vec<ReferenceFrame>,
    ) -> Result<VolumeIndex, SessionError> {
        let index = self.next_volume_index();
        self.install_empty(index, reference_frames)?;
        Ok(index)
    }

    /// Like [`create_volume`](Self::create_volume), naming and numbering the
    /// new series after what the study and session already hold.
    pub fn create_volume_in_study(
        &mut self,
        reference_frames: Vec<ReferenceFrame>,
        study: &StudyContext,
    ) -> Result<VolumeIndex, SessionError> {
        let description = format!("Segmentation #{}", self.volume_count() + 1);
        let series_number = self
            .volumes()
            .filter_map(|v| v.series_metadata.series_number)
            .chain(study.max_series_number())
            .max()
            .map_or(1, |n| n + 1);

        let index = self.create_volume(reference_frames)?;
        if let Some(volume) = self.volumes.get_mut(index).and_then(Option::as_mut) {
            volume.series_metadata.description = Some(description);
            volume.series_metadata.series_number = Some(series_number);
        }
        Ok(index)
    }

    /// Resolves a series' frames through the host and creates a volume over
    /// them. The slot is reserved up front; if resolution fails or this
    /// future is dropped first, the slot is left [`LoadState::Failed`].
    pub async fn create_volume_from_series<R>(
        &mut self,
        resolver: &R,
        series_id: &str,
    ) -> Result<VolumeIndex, SessionError>
    where
        R: ReferenceResolver + ?Sized,
    {
        let index = self.reserve_slot();
        let mut guard = LoadGuard {
            session: self,
            index,
            settled: false,
        };
        let resolved = resolver.resolve_frames(series_id).await;
        guard.settled = true;

        let session = &mut *guard.session;
        let result = resolved
            .map_err(SessionError::from)
            .and_then(|frames| session.install_empty(index, frames));
        match result {
            Ok(()) => Ok(index),
            Err(err) => {
                session.fail_load(index, &err.to_string());
                Err(err)
            }
        }
    }

    /// Removes a volume. Its table is released unless another volume still
    /// renders with it; the shared default table is never released.
    pub fn delete_volume(&mut self, index: VolumeIndex) -> Result<(), SessionError> {
        let volume = self
            .volumes
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(SessionError::UnknownVolume(index))?;

        let lut_index = volume.color_lut_index();
        if !self.volumes().any(|v| v.color_lut_index() == lut_index) {
            self.luts.release(lut_index);
        }
        info!(index, "deleted label volume");
        self.notifications.emit(SegmentationEvent::VolumeDeleted { index });
        if self.active_volume == Some(index) {
            self.activate(None);
        }
        Ok(())
    }

    pub fn set_active_volume(&mut self, index: Option<VolumeIndex>) -> Result<(), SessionError> {
        if let Some(index) = index {
            self.loaded(index)?;
        }
        self.activate(index);
        Ok(())
    }

    // Segments

    /// Adds a segment numbered one past the current segment count, colored
    /// from the volume's table, and makes it the active segment.
    pub fn add_segment(
        &mut self,
        volume_index: VolumeIndex,
    ) -> Result<SegmentNumber, SessionError> {
        let algorithm_name = self.config.default_algorithm_name.clone();
        let volume = self.loaded(volume_index)?;
        let registry = volume.registry();
        let mut number = (registry.len() + 1) as SegmentNumber;
        if registry.contains(number) {
            // numbering has gaps; never overwrite an existing segment
            number = registry.max_number().unwrap_or(0) + 1;
        }
        let lut_index = volume.color_lut_index();
        let color = self.luts.assign_next_color(lut_index, number);

        let other = CodedConcept::other();
        let segment = Segment {
            number,
            label: DEFAULT_LABEL.to_string(),
            category: Some(other.clone()),
            property_type: Some(other),
            modifier: None,
            algorithm_type: AlgorithmType::Manual,
            algorithm_name: Some(algorithm_name),
            display_color: Some(rgba_to_dicom_lab(color)),
            visible: true,
        };

        let volume = self.loaded_mut(volume_index)?;
        volume.registry_mut().insert(segment)?;
        volume.list_on_first_slice(number)?;
        let previous = volume.active_segment_number();
        volume.set_active_segment_number(number);
        if let Some(lut) = self.luts.get_mut(lut_index) {
            lut.set_color(number, color);
        }

        debug!(volume = volume_index, number, "added segment");
        self.notifications.emit(SegmentationEvent::SegmentAdded {
            volume_index,
            number,
        });
        self.notifications.emit(SegmentationEvent::ActiveSegmentChanged {
            volume_index,
            previous,
            current: number,
        });
        Ok(number)
    }

    /// Removes a segment from the registry and every slice. Returns false
    /// when there was nothing to remove, which is not an error.
    pub fn delete_segment(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<bool, SessionError> {
        if number == BACKGROUND {
            return Err(SessionError::ReservedSegment);
        }
        let volume = self.loaded_mut(volume_index)?;
        let removed = volume.remove_segment(number);
        let lut_index = volume.color_lut_index();
        if removed {
            // a later segment with this number starts from its palette color
            if lut_index != DEFAULT_LUT_INDEX
                && let Some(lut) = self.luts.get_mut(lut_index)
            {
                lut.reset_color(number);
            }
            debug!(volume = volume_index, number, "deleted segment");
            self.notifications.emit(SegmentationEvent::SegmentDeleted {
                volume_index,
                number,
            });
            self.notifications.emit(SegmentationEvent::LabelmapMutated { volume_index });
        }
        Ok(removed)
    }

    /// Replaces a segment's codes and label.
    pub fn relabel_segment(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
        relabel: Relabel,
    ) -> Result<&Segment, SessionError> {
        let volume = self.registered_mut(volume_index, number)?;
        let label = volume.registry_mut().relabel(number, relabel)?.label.clone();
        self.notifications.emit(SegmentationEvent::SegmentRelabeled {
            volume_index,
            number,
            label,
        });
        self.segment(volume_index, number)
    }

    /// The volume, provided it has a segment `number`.
    fn registered_mut(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<&mut LabelVolume, SessionError> {
        if number == BACKGROUND {
            return Err(SessionError::ReservedSegment);
        }
        let volume = self.loaded_mut(volume_index)?;
        if !volume.registry().contains(number) {
            return Err(SessionError::UnknownSegment {
                volume_index,
                number,
            });
        }
        Ok(volume)
    }

    pub fn segment(
        &self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<&Segment, SessionError> {
        self.loaded(volume_index)?
            .registry()
            .get(number)
            .ok_or(SessionError::UnknownSegment {
                volume_index,
                number,
            })
    }

    /// Sets the persisted color of a segment and its table entry. A volume
    /// still drawing with the shared default table gets a copy of it first,
    /// so other volumes keep their colors.
    pub fn set_segment_color(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
        color: Rgba<u8>,
    ) -> Result<(), SessionError> {
        let mut lut_index = self.registered_mut(volume_index, number)?.color_lut_index();
        if lut_index == DEFAULT_LUT_INDEX {
            let copy = self
                .luts
                .get(DEFAULT_LUT_INDEX)
                .cloned()
                .unwrap_or_else(|| ColorLut::from_palette(self.config.palette));
            lut_index = self.luts.insert(copy);
        }

        let volume = self.loaded_mut(volume_index)?;
        volume.set_color_lut_index(lut_index);
        if let Some(segment) = volume.registry_mut().get_mut(number) {
            segment.display_color = Some(rgba_to_dicom_lab(color));
        }
        if let Some(lut) = self.luts.get_mut(lut_index) {
            lut.set_color(number, color);
        }
        Ok(())
    }

    /// Color a segment is drawn with.
    pub fn segment_color(
        &self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<Rgba<u8>, SessionError> {
        let volume = self
            .volume(volume_index)
            .ok_or(SessionError::UnknownVolume(volume_index))?;
        Ok(self
            .luts
            .assign_next_color(volume.color_lut_index(), number))
    }

    /// Flips a segment's visibility and returns the new value.
    pub fn toggle_visibility(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<bool, SessionError> {
        let segment = self
            .loaded_mut(volume_index)?
            .registry_mut()
            .get_mut(number)
            .ok_or(SessionError::UnknownSegment {
                volume_index,
                number,
            })?;
        segment.visible = !segment.visible;
        let visible = segment.visible;
        self.notifications.emit(SegmentationEvent::SegmentVisibilityChanged {
            volume_index,
            number,
            visible,
        });
        Ok(visible)
    }

    pub fn set_active_segment(
        &mut self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<(), SessionError> {
        let volume = self.loaded_mut(volume_index)?;
        let previous = volume.active_segment_number();
        if previous == number {
            return Ok(());
        }
        volume.set_active_segment_number(number);
        self.notifications.emit(SegmentationEvent::ActiveSegmentChanged {
            volume_index,
            previous,
            current: number,
        });
        Ok(())
    }

    pub fn increment_active_segment(
        &mut self,
        volume_index: VolumeIndex,
    ) -> Result<SegmentNumber, SessionError> {
        let next = self
            .loaded(volume_index)?
            .active_segment_number()
            .saturating_add(1);
        self.set_active_segment(volume_index, next)?;
        Ok(next)
    }

    /// Steps the active segment down, never below 1.
    pub fn decrement_active_segment(
        &mut self,
        volume_index: VolumeIndex,
    ) -> Result<SegmentNumber, SessionError> {
        let next = self
            .loaded(volume_index)?
            .active_segment_number()
            .saturating_sub(1)
            .max(1);
        self.set_active_segment(volume_index, next)?;
        Ok(next)
    }

    // Labelmap

    /// Writes `number` at the given (row, column) pixels of one frame.
    /// Returns how many pixels changed.
    pub fn paint(
        &mut self,
        volume_index: VolumeIndex,
        frame: usize,
        pixels: impl IntoIterator<Item = (usize, usize)>,
        number: SegmentNumber,
    ) -> Result<usize, SessionError> {
        let volume = self.loaded_mut(volume_index)?;
        let new_segment = number != BACKGROUND && !volume.registry().contains(number);
        let changed = volume.paint(frame, pixels, number)?;
        if new_segment {
            self.notifications.emit(SegmentationEvent::SegmentAdded {
                volume_index,
                number,
            });
        }
        self.notifications.emit(SegmentationEvent::LabelmapMutated { volume_index });
        Ok(changed)
    }

    pub fn erase(
        &mut self,
        volume_index: VolumeIndex,
        frame: usize,
        pixels: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<usize, SessionError> {
        self.paint(volume_index, frame, pixels, BACKGROUND)
    }

    /// Replaces every slice from a raw little-endian `u16` labelmap.
    pub fn import_raw_labelmap(
        &mut self,
        volume_index: VolumeIndex,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        self.loaded_mut(volume_index)?.import_raw_labelmap(bytes)?;
        self.notifications.emit(SegmentationEvent::LabelmapMutated { volume_index });
        Ok(())
    }

    pub fn segments_present_on(
        &self,
        volume_index: VolumeIndex,
        frame: usize,
    ) -> Result<BTreeSet<SegmentNumber>, SessionError> {
        let volume = self.loaded(volume_index)?;
        if !volume.is_valid_index(frame) {
            return Err(VolumeError::FrameOutOfRange {
                frame,
                frame_count: volume.reference_frame_count(),
            }
            .into());
        }
        Ok(volume.segments_present_on(frame))
    }

    /// Segment numbers the segment panel lists for a volume.
    pub fn segment_listing(
        &self,
        volume_index: VolumeIndex,
    ) -> Result<BTreeSet<SegmentNumber>, SessionError> {
        Ok(self.loaded(volume_index)?.segment_listing())
    }

    /// Frame to jump to when a segment is selected in the panel.
    pub fn closest_slice(
        &self,
        volume_index: VolumeIndex,
        number: SegmentNumber,
    ) -> Result<Option<usize>, SessionError> {
        Ok(self.loaded(volume_index)?.closest_slice(number))
    }

    /// Text color readable on top of a CSS `rgba(...)` background.
    pub fn contrast_color(&self, background: &str) -> ContrastColor {
        contrast_color(background)
    }

    // Codec

    fn series_options(&self, volume: &LabelVolume, options: &SeriesOptions) -> SeriesOptions {
        let metadata = &volume.series_metadata;
        SeriesOptions {
            manufacturer: options
                .manufacturer
                .clone()
                .or_else(|| metadata.manufacturer.clone())
                .or_else(|| Some(self.config.manufacturer.clone())),
            image_comments: options
                .image_comments
                .clone()
                .or_else(|| metadata.comment.clone())
                .or_else(|| Some(self.config.image_comments.clone())),
            ..options.clone()
        }
    }

    /// Encodes a volume as a DICOM Segmentation joining `study`.
    ///
    /// # Errors
    ///
    /// Returns error if the volume does not exist or has no reference frames
    pub fn encode(
        &self,
        volume_index: VolumeIndex,
        study: &StudyContext,
        options: &SeriesOptions,
    ) -> Result<EncodedSegmentation, SessionError> {
        let volume = match self.volume(volume_index) {
            Some(volume) if volume.is_loaded() => volume,
            Some(volume) if volume.reference_frame_count() == 0 => {
                return Err(CodecEncodeError::NoReferenceFrames.into());
            }
            _ => return Err(CodecEncodeError::NoVolume.into()),
        };
        let lut = self
            .luts
            .get(volume.color_lut_index())
            .cloned()
            .unwrap_or_else(|| ColorLut::from_palette(self.config.palette));
        let options = self.series_options(volume, options);
        Ok(SegEncoder::encode(volume, &lut, study, &options)?)
    }

    /// Encodes the active volume.
    pub fn encode_active(
        &self,
        study: &StudyContext,
        options: &SeriesOptions,
    ) -> Result<EncodedSegmentation, SessionError> {
        let index = self.active_volume.ok_or(CodecEncodeError::NoVolume)?;
        self.encode(index, study, options)
    }

    pub fn encode_to_bytes(
        &self,
        volume_index: VolumeIndex,
        study: &StudyContext,
        options: &SeriesOptions,
    ) -> Result<Vec<u8>, SessionError> {
        Ok(self.encode(volume_index, study, options)?.to_bytes()?)
    }

    /// Encodes a volume and packages it for the host to store.
    pub fn prepare_persist(
        &self,
        volume_index: VolumeIndex,
        study: &StudyContext,
        options: &SeriesOptions,
    ) -> Result<PersistRequest, SessionError> {
        let encoded = self.encode(volume_index, study, options)?;
        let overwrite = self
            .volume(volume_index)
            .is_some_and(|v| v.series_metadata.sop_instance_uid.is_some());
        Ok(PersistRequest {
            study_id: study.study_instance_uid.clone(),
            overwrite,
            bytes: encoded.to_bytes()?,
            sop_instance_uid: encoded.sop_instance_uid,
            series_instance_uid: encoded.series_instance_uid,
        })
    }

    /// Remembers the identifiers a volume was stored under, so the next
    /// persist overwrites that object.
    pub fn record_persisted(
        &mut self,
        volume_index: VolumeIndex,
        sop_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
    ) -> Result<(), SessionError> {
        let metadata = &mut self.loaded_mut(volume_index)?.series_metadata;
        metadata.sop_instance_uid = Some(sop_instance_uid.into());
        metadata.series_instance_uid = Some(series_instance_uid.into());
        Ok(())
    }

    fn install_decoded(
        &mut self,
        index: VolumeIndex,
        decoded: DecodedSegmentation,
    ) -> Result<LoadedSegmentation, SessionError> {
        let DecodedSegmentation {
            reference_frames,
            slices,
            registry,
            colors,
            series_metadata,
            warnings,
        } = decoded;

        let lut_index = match colors {
            DecodedColors::SharedDefault => DEFAULT_LUT_INDEX,
            DecodedColors::Custom(_) => self.luts.next_free_lut_index(),
        };
        let mut volume = LabelVolume::new(index, reference_frames, lut_index)?;
        volume.install(slices, registry)?;
        volume.series_metadata = series_metadata;
        let first = volume.registry().numbers().next();
        if let Some(first) = first {
            volume.set_active_segment_number(first);
        }
        if let DecodedColors::Custom(lut) = colors {
            self.luts.set(lut_index, lut);
        }

        let frame_ids = volume.frame_ids();
        let segment_count = volume.registry().len();
        self.place(volume);
        for warning in &warnings {
            warn!(volume = index, "{}", warning.message());
        }
        self.notifications.emit(SegmentationEvent::VolumeCreated { index });
        self.notifications.emit(SegmentationEvent::SegmentationDecoded {
            volume_index: index,
            frame_ids,
            segment_count,
        });
        self.activate(Some(index));
        Ok(LoadedSegmentation {
            volume_index: index,
            warnings,
        })
    }

    fn settle_segmentation_load(
        &mut self,
        index: VolumeIndex,
        bytes: &[u8],
        reference_frames: Result<Vec<ReferenceFrame>, ReferenceLoadError>,
    ) -> Result<LoadedSegmentation, SessionError> {
        let result = reference_frames.map_err(SessionError::from).and_then(|frames| {
            let decoded =
                SegDecoder::decode_bytes(bytes, frames, &self.catalog, self.config.palette)?;
            self.install_decoded(index, decoded)
        });
        if let Err(err) = &result {
            self.fail_load(index, &err.to_string());
        }
        result
    }

    /// Decodes Part 10 bytes against known reference frames into a new
    /// volume, which becomes active.
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails. The reserved volume is then left
    /// [`LoadState::Failed`].
    pub fn load_segmentation(
        &mut self,
        bytes: &[u8],
        reference_frames: Vec<ReferenceFrame>,
    ) -> Result<LoadedSegmentation, SessionError> {
        let index = self.reserve_slot();
        self.settle_segmentation_load(index, bytes, Ok(reference_frames))
    }

    /// Resolves the reference series through the host, then decodes.
    /// Dropping the future before it completes leaves the reserved volume
    /// [`LoadState::Failed`].
    pub async fn load_segmentation_from_series<R>(
        &mut self,
        resolver: &R,
        series_id: &str,
        bytes: &[u8],
    ) -> Result<LoadedSegmentation, SessionError>
    where
        R: ReferenceResolver + ?Sized,
    {
        let started = Instant::now();
        let index = self.reserve_slot();
        let mut guard = LoadGuard {
            session: self,
            index,
            settled: false,
        };
        let resolved = resolver.resolve_frames(series_id).await;
        guard.settled = true;

        let result = guard
            .session
            .settle_segmentation_load(index, bytes, resolved);
        info!(
            index,
            series = series_id,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "segmentation load finished"
        );
        result
    }
}
