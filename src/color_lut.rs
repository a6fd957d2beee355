//! Indexed RGBA lookup tables shared between label volumes.

use image::Rgba;
use tracing::debug;

use crate::color::{DicomLab, Palette, dicom_lab_to_rgba};

pub type LutIndex = usize;

/// Index of the shared default palette.
pub const DEFAULT_LUT_INDEX: LutIndex = 0;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Ordered RGBA entries indexed by segment number. Entry 0 is background and
/// is never rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorLut {
    entries: Vec<Rgba<u8>>,
    palette: Palette,
}

impl ColorLut {
    /// An empty table whose unset entries come from `palette`.
    pub fn from_palette(palette: Palette) -> Self {
        Self {
            entries: vec![TRANSPARENT],
            palette,
        }
    }

    /// Color for a segment number. Numbers past the populated range fall back
    /// to the palette.
    pub fn color(&self, segment_number: u16) -> Rgba<u8> {
        if segment_number == 0 {
            return TRANSPARENT;
        }
        self.entries
            .get(segment_number as usize)
            .copied()
            .unwrap_or_else(|| self.palette.color(segment_number))
    }

    /// Overwrites one entry, growing the table with palette colors as needed.
    /// Writes to the background entry are ignored.
    pub fn set_color(&mut self, segment_number: u16, color: Rgba<u8>) {
        if segment_number == 0 {
            return;
        }
        let index = segment_number as usize;
        while self.entries.len() <= index {
            let next = self.entries.len() as u16;
            self.entries.push(self.palette.color(next));
        }
        self.entries[index] = color;
    }

    /// Puts an entry back to its palette color.
    pub fn reset_color(&mut self, segment_number: u16) {
        let color = self.palette.color(segment_number);
        self.set_color(segment_number, color);
    }

    pub fn set_dicom_lab(&mut self, segment_number: u16, color: DicomLab) {
        self.set_color(segment_number, dicom_lab_to_rgba(color));
    }

    /// Number of populated entries, background included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn palette(&self) -> Palette {
        self.palette
    }
}

/// Owns every lookup table in a session. Slot 0 always holds the default
/// palette.
#[derive(Debug, Clone)]
pub struct ColorLutManager {
    tables: Vec<Option<ColorLut>>,
    palette: Palette,
}

impl ColorLutManager {
    pub fn new(palette: Palette) -> Self {
        Self {
            tables: vec![Some(ColorLut::from_palette(palette))],
            palette,
        }
    }

    /// Lowest slot without a table, or the current slot count when every slot
    /// is taken.
    pub fn next_free_lut_index(&self) -> LutIndex {
        self.tables
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.tables.len())
    }

    pub fn get(&self, index: LutIndex) -> Option<&ColorLut> {
        self.tables.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: LutIndex) -> Option<&mut ColorLut> {
        self.tables.get_mut(index).and_then(Option::as_mut)
    }

    /// Installs `lut` at `index`, replacing anything already there.
    pub fn set(&mut self, index: LutIndex, lut: ColorLut) {
        if self.tables.len() <= index {
            self.tables.resize(index + 1, None);
        }
        self.tables[index] = Some(lut);
    }

    /// Stores `lut` in the lowest free slot and returns that slot.
    pub fn insert(&mut self, lut: ColorLut) -> LutIndex {
        let index = self.next_free_lut_index();
        self.set(index, lut);
        debug!(index, "allocated color LUT");
        index
    }

    /// Allocates a table filled from the default palette.
    pub fn allocate_default(&mut self) -> LutIndex {
        self.insert(ColorLut::from_palette(self.palette))
    }

    /// Frees a slot. The shared default table cannot be released.
    pub fn release(&mut self, index: LutIndex) -> Option<ColorLut> {
        if index == DEFAULT_LUT_INDEX {
            return None;
        }
        let released = self.tables.get_mut(index).and_then(Option::take);
        if released.is_some() {
            debug!(index, "released color LUT");
        }
        released
    }

    /// Palette color that a segment gets in table `index` before anything
    /// overrides it.
    pub fn assign_next_color(&self, index: LutIndex, segment_number: u16) -> Rgba<u8> {
        self.get(index)
            .map(|lut| lut.color(segment_number))
            .unwrap_or_else(|| self.palette.color(segment_number))
    }

    pub fn palette(&self) -> Palette {
        self.palette
    }

    /// Number of slots, vacant ones included.
    pub fn slot_count(&self) -> usize {
        self.tables.len()
    }
}

impl Default for ColorLutManager {
    fn default() -> Self {
        Self::new(Palette::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_free_index_prefers_a_vacant_slot() {
        let mut manager = ColorLutManager::default();
        manager.allocate_default();
        manager.allocate_default();
        // [defined, undefined, defined]
        manager.release(1);
        assert_eq!(manager.next_free_lut_index(), 1);
    }

    #[test]
    fn next_free_index_appends_when_full() {
        let mut manager = ColorLutManager::default();
        assert_eq!(manager.next_free_lut_index(), 1);
        assert_eq!(manager.allocate_default(), 1);
        assert_eq!(manager.next_free_lut_index(), 2);
    }

    #[test]
    fn default_table_is_never_released() {
        let mut manager = ColorLutManager::default();
        assert!(manager.release(DEFAULT_LUT_INDEX).is_none());
        assert!(manager.get(DEFAULT_LUT_INDEX).is_some());
    }

    #[test]
    fn background_entry_stays_transparent() {
        let mut lut = ColorLut::from_palette(Palette::default());
        lut.set_color(0, Rgba([1, 2, 3, 255]));
        lut.set_color(3, Rgba([10, 20, 30, 255]));
        assert_eq!(lut.color(0), Rgba([0, 0, 0, 0]));
        assert_eq!(lut.color(3), Rgba([10, 20, 30, 255]));
        assert_eq!(lut.color(2), Palette::default().color(2));
        assert_eq!(lut.len(), 4);
    }
}
