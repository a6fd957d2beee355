use std::collections::BTreeSet;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

use crate::color_lut::LutIndex;
use crate::enums::LoadState;
use crate::reference_loader::{ReferenceFrame, ReferenceLoadError};
use crate::segment::{BACKGROUND, RegistryError, SegmentNumber, SegmentRegistry};

pub type VolumeIndex = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("frame {frame} is outside the volume ({frame_count} frames)")]
    FrameOutOfRange { frame: usize, frame_count: usize },

    #[error("pixel ({row}, {column}) is outside frame {frame}")]
    PixelOutOfRange {
        frame: usize,
        row: usize,
        column: usize,
    },

    #[error("raw labelmap has {actual} bytes, expected {expected}")]
    RawBufferSize { expected: usize, actual: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Header fields carried from and into the stored segmentation object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesMetadata {
    pub description: Option<String>,
    pub series_number: Option<i32>,
    pub manufacturer: Option<String>,
    pub comment: Option<String>,
    /// Set once the volume exists as a stored object.
    pub sop_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
}

/// One indexed 2D buffer: every pixel holds a segment number, 0 for
/// background.
///
/// Besides the pixels, a slice keeps the set of segment numbers it lists.
/// The set can name a segment before any of its pixels are painted.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSlice {
    pixels: Array2<u16>,
    segments_present: BTreeSet<SegmentNumber>,
}

impl LabelSlice {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            pixels: Array2::zeros((rows, columns)),
            segments_present: BTreeSet::new(),
        }
    }

    /// Wraps an existing buffer and lists whatever it contains.
    pub fn from_pixels(pixels: Array2<u16>) -> Self {
        let mut slice = Self {
            pixels,
            segments_present: BTreeSet::new(),
        };
        slice.segments_present = slice.scan_segments();
        slice
    }

    /// Get the dimensions of the slice (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> ArrayView2<'_, u16> {
        self.pixels.view()
    }

    pub fn get(&self, row: usize, column: usize) -> Option<SegmentNumber> {
        self.pixels.get((row, column)).copied()
    }

    /// Segment numbers this slice lists.
    pub fn segments_present(&self) -> &BTreeSet<SegmentNumber> {
        &self.segments_present
    }

    pub fn lists(&self, number: SegmentNumber) -> bool {
        self.segments_present.contains(&number)
    }

    pub fn list_segment(&mut self, number: SegmentNumber) {
        if number != BACKGROUND {
            self.segments_present.insert(number);
        }
    }

    /// Distinct non-zero values actually present in the buffer, ascending.
    pub fn scan_segments(&self) -> BTreeSet<SegmentNumber> {
        self.pixels
            .par_iter()
            .filter(|&&value| value != BACKGROUND)
            .fold(BTreeSet::new, |mut found, &value| {
                found.insert(value);
                found
            })
            .reduce(BTreeSet::new, |mut left, right| {
                left.extend(right);
                left
            })
    }

    /// Binary mask of one segment, row-major.
    pub fn mask(&self, number: SegmentNumber) -> Vec<bool> {
        self.pixels.iter().map(|&value| value == number).collect()
    }

    /// Writes `number` at every given pixel. Returns how many pixels changed.
    pub(crate) fn paint(
        &mut self,
        frame: usize,
        pixels: impl IntoIterator<Item = (usize, usize)>,
        number: SegmentNumber,
    ) -> Result<usize, VolumeError> {
        let mut changed = 0;
        for (row, column) in pixels {
            let value = self
                .pixels
                .get_mut((row, column))
                .ok_or(VolumeError::PixelOutOfRange { frame, row, column })?;
            if *value != number {
                *value = number;
                changed += 1;
            }
        }
        self.list_segment(number);
        Ok(changed)
    }

    /// Sets every pixel of `number` to background and stops listing it.
    pub(crate) fn strip_segment(&mut self, number: SegmentNumber) -> usize {
        self.segments_present.remove(&number);
        let mut cleared = 0;
        for value in self.pixels.iter_mut().filter(|value| **value == number) {
            *value = BACKGROUND;
            cleared += 1;
        }
        cleared
    }
}

/// Indexed segmentation overlay bound to a reference image series.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    index: VolumeIndex,
    reference_frames: Vec<ReferenceFrame>,
    slices: Vec<Option<LabelSlice>>,
    registry: SegmentRegistry,
    color_lut_index: LutIndex,
    active_segment_number: SegmentNumber,
    load_state: LoadState,
    pub series_metadata: SeriesMetadata,
}

impl LabelVolume {
    /// An empty volume over `reference_frames`.
    ///
    /// # Errors
    ///
    /// Returns error if there are no frames or a frame has no pixels
    pub fn new(
        index: VolumeIndex,
        reference_frames: Vec<ReferenceFrame>,
        color_lut_index: LutIndex,
    ) -> Result<Self, ReferenceLoadError> {
        if reference_frames.is_empty() {
            return Err(ReferenceLoadError::NoValidImages);
        }
        if let Some(frame) = reference_frames.iter().find(|f| f.pixel_count() == 0) {
            return Err(ReferenceLoadError::UnresolvedFrame {
                frame_id: frame.frame_id.clone(),
            });
        }
        let frame_count = reference_frames.len();
        Ok(Self {
            index,
            reference_frames,
            slices: vec![None; frame_count],
            registry: SegmentRegistry::new(),
            color_lut_index,
            active_segment_number: BACKGROUND,
            load_state: LoadState::Loaded,
            series_metadata: SeriesMetadata::default(),
        })
    }

    /// Placeholder that reserves an index while its data is still loading.
    pub(crate) fn pending(index: VolumeIndex, color_lut_index: LutIndex) -> Self {
        Self {
            index,
            reference_frames: Vec::new(),
            slices: Vec::new(),
            registry: SegmentRegistry::new(),
            color_lut_index,
            active_segment_number: BACKGROUND,
            load_state: LoadState::Loading,
            series_metadata: SeriesMetadata::default(),
        }
    }

    pub fn index(&self) -> VolumeIndex {
        self.index
    }

    pub fn reference_frames(&self) -> &[ReferenceFrame] {
        &self.reference_frames
    }

    pub fn reference_frame_count(&self) -> usize {
        self.reference_frames.len()
    }

    pub fn frame_ids(&self) -> Vec<String> {
        self.reference_frames
            .iter()
            .map(|f| f.frame_id.clone())
            .collect()
    }

    pub fn color_lut_index(&self) -> LutIndex {
        self.color_lut_index
    }

    pub(crate) fn set_color_lut_index(&mut self, index: LutIndex) {
        self.color_lut_index = index;
    }

    pub fn active_segment_number(&self) -> SegmentNumber {
        self.active_segment_number
    }

    pub(crate) fn set_active_segment_number(&mut self, number: SegmentNumber) {
        self.active_segment_number = number;
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut SegmentRegistry {
        &mut self.registry
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn load_error(&self) -> bool {
        self.load_state == LoadState::Failed
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    pub(crate) fn mark_failed(&mut self) {
        self.load_state = LoadState::Failed;
    }

    /// Numbers of segments suppressed from rendering.
    pub fn hidden_segments(&self) -> BTreeSet<SegmentNumber> {
        self.registry.hidden().collect()
    }

    pub fn is_valid_index(&self, frame: usize) -> bool {
        frame < self.slices.len()
    }

    fn check_frame(&self, frame: usize) -> Result<(), VolumeError> {
        if self.is_valid_index(frame) {
            Ok(())
        } else {
            Err(VolumeError::FrameOutOfRange {
                frame,
                frame_count: self.slices.len(),
            })
        }
    }

    /// The slice of a frame, if anything was ever labelled on it.
    pub fn slice(&self, frame: usize) -> Option<&LabelSlice> {
        self.slices.get(frame).and_then(Option::as_ref)
    }

    /// Every frame's slice, `None` where nothing is labelled.
    pub fn slices(&self) -> &[Option<LabelSlice>] {
        &self.slices
    }

    pub(crate) fn slice_mut(&mut self, frame: usize) -> Result<&mut LabelSlice, VolumeError> {
        self.check_frame(frame)?;
        let (rows, columns) = self.reference_frames[frame].dim();
        Ok(self.slices[frame].get_or_insert_with(|| LabelSlice::new(rows, columns)))
    }

    /// Replaces slices and segments with decoded contents. `slices` holds one
    /// entry per reference frame.
    pub(crate) fn install(
        &mut self,
        slices: Vec<Option<LabelSlice>>,
        registry: SegmentRegistry,
    ) -> Result<(), VolumeError> {
        if slices.len() != self.reference_frames.len() {
            return Err(VolumeError::FrameOutOfRange {
                frame: slices.len().saturating_sub(1),
                frame_count: self.reference_frames.len(),
            });
        }
        self.slices = slices;
        self.registry = registry;
        Ok(())
    }

    /// Distinct segment numbers painted on a frame. Unlike the slice listing
    /// this reads the pixels, so it never reports stale entries.
    pub fn segments_present_on(&self, frame: usize) -> BTreeSet<SegmentNumber> {
        self.slice(frame)
            .map(LabelSlice::scan_segments)
            .unwrap_or_default()
    }

    /// Every segment number listed by any slice, ascending.
    pub fn segment_listing(&self) -> BTreeSet<SegmentNumber> {
        self.slices
            .iter()
            .flatten()
            .flat_map(|slice| slice.segments_present().iter().copied())
            .collect()
    }

    /// Segment numbers listed anywhere or painted anywhere.
    pub fn referenced_segments(&self) -> BTreeSet<SegmentNumber> {
        let painted: BTreeSet<SegmentNumber> = self
            .slices
            .par_iter()
            .flatten()
            .map(LabelSlice::scan_segments)
            .reduce(BTreeSet::new, |mut left, right| {
                left.extend(right);
                left
            });
        let mut referenced = self.segment_listing();
        referenced.extend(painted);
        referenced
    }

    /// Makes `number` show up in listings without painting it: the first
    /// existing slice lists it, or frame 0 is created for that purpose.
    pub(crate) fn list_on_first_slice(&mut self, number: SegmentNumber) -> Result<(), VolumeError> {
        let frame = self
            .slices
            .iter()
            .position(Option::is_some)
            .unwrap_or(0);
        self.slice_mut(frame)?.list_segment(number);
        Ok(())
    }

    /// Paints `number` (0 erases) at the given (row, column) pixels.
    /// Unregistered segment numbers are registered with default metadata.
    pub(crate) fn paint(
        &mut self,
        frame: usize,
        pixels: impl IntoIterator<Item = (usize, usize)>,
        number: SegmentNumber,
    ) -> Result<usize, VolumeError> {
        self.check_frame(frame)?;
        if number != BACKGROUND && !self.registry.contains(number) {
            self.registry.ensure_default(number)?;
        }
        self.slice_mut(frame)?.paint(frame, pixels, number)
    }

    /// Removes a segment from the registry and from every slice.
    /// Returns false when there was nothing to remove.
    pub(crate) fn remove_segment(&mut self, number: SegmentNumber) -> bool {
        let registered = self.registry.remove(number).is_some();
        let mut listed = false;
        for slice in self.slices.iter_mut().flatten() {
            listed |= slice.lists(number);
            slice.strip_segment(number);
        }
        registered || listed
    }

    /// Frame nearest the mean of all frames that list `number`.
    pub fn closest_slice(&self, number: SegmentNumber) -> Option<usize> {
        let matching: Vec<usize> = self
            .slices
            .iter()
            .enumerate()
            .filter(|(_, slice)| slice.as_ref().is_some_and(|s| s.lists(number)))
            .map(|(frame, _)| frame)
            .collect();
        closest_to_mean(&matching)
    }

    /// Replaces all slices from a little-endian `u16` buffer holding every
    /// frame back to back, as viewers keep their labelmaps in memory.
    pub(crate) fn import_raw_labelmap(&mut self, bytes: &[u8]) -> Result<(), VolumeError> {
        let expected: usize = self
            .reference_frames
            .iter()
            .map(|f| f.pixel_count() * 2)
            .sum();
        if bytes.len() != expected {
            return Err(VolumeError::RawBufferSize {
                expected,
                actual: bytes.len(),
            });
        }
        let values: Vec<u16> = bytemuck::pod_collect_to_vec::<u8, u16>(bytes)
            .into_iter()
            .map(u16::from_le)
            .collect();

        let mut offset = 0;
        for (frame, reference) in self.reference_frames.iter().enumerate() {
            let count = reference.pixel_count();
            let chunk = &values[offset..offset + count];
            offset += count;
            self.slices[frame] = if chunk.iter().all(|&v| v == BACKGROUND) {
                None
            } else {
                let pixels = Array2::from_shape_vec(reference.dim(), chunk.to_vec())
                    .map_err(|_| VolumeError::RawBufferSize {
                        expected,
                        actual: bytes.len(),
                    })?;
                Some(LabelSlice::from_pixels(pixels))
            };
        }
        for number in self.segment_listing() {
            self.registry.ensure_default(number)?;
        }
        Ok(())
    }

    /// All frames back to back as little-endian `u16` bytes.
    pub fn export_raw_labelmap(&self) -> Vec<u8> {
        let mut values = Vec::new();
        for (frame, reference) in self.reference_frames.iter().enumerate() {
            match self.slice(frame) {
                Some(slice) => values.extend(slice.pixels().iter().map(|v| v.to_le())),
                None => values.extend(std::iter::repeat_n(0u16, reference.pixel_count())),
            }
        }
        bytemuck::cast_slice::<u16, u8>(&values).to_vec()
    }
}

/// Index closest to the arithmetic mean of `indices`; on a tie the lower
/// index wins.
pub fn closest_to_mean(indices: &[usize]) -> Option<usize> {
    let first = *indices.first()?;
    let mean = indices.iter().sum::<usize>() as f64 / indices.len() as f64;
    let distance = |index: usize| (index as f64 - mean).abs();
    Some(indices.iter().copied().fold(first, |best, candidate| {
        let (d_best, d_candidate) = (distance(best), distance(candidate));
        if d_candidate < d_best || (d_candidate == d_best && candidate < best) {
            candidate
        } else {
            best
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(frames: usize) -> LabelVolume {
        let frames = (0..frames)
            .map(|i| ReferenceFrame::new(format!("1.2.3.{i}"), 2, 3))
            .collect();
        LabelVolume::new(0, frames, 0).unwrap()
    }

    #[test]
    fn slices_are_created_lazily() {
        let mut volume = volume(4);
        assert_eq!(volume.slices().len(), 4);
        assert!(volume.slice(1).is_none());
        volume.paint(1, [(0, 0), (1, 2)], 3).unwrap();
        assert_eq!(volume.slice(1).unwrap().dim(), (2, 3));
        assert!(volume.slice(0).is_none());
        assert!(volume.registry().contains(3));
    }

    #[test]
    fn frames_without_pixels_are_rejected() {
        let frames = vec![ReferenceFrame::new("a", 2, 2), ReferenceFrame::new("b", 0, 2)];
        assert!(matches!(
            LabelVolume::new(0, frames, 0),
            Err(ReferenceLoadError::UnresolvedFrame { frame_id }) if frame_id == "b"
        ));
        assert!(matches!(
            LabelVolume::new(0, Vec::new(), 0),
            Err(ReferenceLoadError::NoValidImages)
        ));
    }

    #[test]
    fn out_of_range_paint_is_rejected() {
        let mut volume = volume(2);
        assert_eq!(
            volume.paint(2, [(0, 0)], 1).unwrap_err(),
            VolumeError::FrameOutOfRange {
                frame: 2,
                frame_count: 2
            }
        );
        assert_eq!(
            volume.paint(0, [(2, 0)], 1).unwrap_err(),
            VolumeError::PixelOutOfRange {
                frame: 0,
                row: 2,
                column: 0
            }
        );
    }

    #[test]
    fn scan_reports_distinct_painted_values() {
        let mut volume = volume(1);
        volume.paint(0, [(0, 0), (0, 1)], 5).unwrap();
        volume.paint(0, [(1, 1)], 2).unwrap();
        assert_eq!(
            volume.segments_present_on(0).into_iter().collect::<Vec<_>>(),
            vec![2, 5]
        );
        // overwriting the only pixel of 2 leaves it listed but not painted
        volume.paint(0, [(1, 1)], 5).unwrap();
        assert_eq!(volume.segments_present_on(0).len(), 1);
        assert!(volume.slice(0).unwrap().lists(2));
    }

    #[test]
    fn removing_a_segment_strips_every_slice() {
        let mut volume = volume(3);
        volume.paint(0, [(0, 0)], 1).unwrap();
        volume.paint(2, [(1, 1)], 1).unwrap();
        volume.paint(2, [(0, 0)], 2).unwrap();
        assert!(volume.remove_segment(1));
        assert!(!volume.segment_listing().contains(&1));
        assert_eq!(volume.slice(2).unwrap().get(1, 1), Some(0));
        assert_eq!(volume.slice(2).unwrap().get(0, 0), Some(2));
        assert!(!volume.remove_segment(1));
    }

    #[test]
    fn closest_slice_uses_the_mean() {
        assert_eq!(closest_to_mean(&[2, 4, 9]), Some(4));
        assert_eq!(closest_to_mean(&[1, 3]), Some(1));
        assert_eq!(closest_to_mean(&[3, 1]), Some(1));
        assert_eq!(closest_to_mean(&[]), None);

        let mut volume = volume(10);
        for frame in [2, 4, 9] {
            volume.paint(frame, [(0, 0)], 7).unwrap();
        }
        assert_eq!(volume.closest_slice(7), Some(4));
        assert_eq!(volume.closest_slice(8), None);
    }

    #[test]
    fn raw_labelmap_round_trips() {
        let mut volume = volume(2);
        volume.paint(1, [(1, 2)], 9).unwrap();
        let raw = volume.export_raw_labelmap();
        assert_eq!(raw.len(), 2 * 6 * 2);

        let mut copy = self::volume(2);
        copy.import_raw_labelmap(&raw).unwrap();
        assert!(copy.slice(0).is_none());
        assert_eq!(copy.slice(1).unwrap().get(1, 2), Some(9));
        assert!(copy.registry().contains(9));
        assert_eq!(
            copy.import_raw_labelmap(&raw[1..]).unwrap_err(),
            VolumeError::RawBufferSize {
                expected: 24,
                actual: 23
            }
        );
    }
}
