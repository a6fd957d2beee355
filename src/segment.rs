//! Clinical identity of the labels inside one label volume.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    catalog::{CodedConcept, CodingCatalog},
    color::DicomLab,
    enums::{AlgorithmType, CodedField},
};

/// Value stored in a label slice. 0 is background.
pub type SegmentNumber = u16;

pub const BACKGROUND: SegmentNumber = 0;

pub const DEFAULT_LABEL: &str = "(unlabeled)";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("segment number 0 is reserved for background")]
    ReservedSegmentNumber,

    #[error("segment {number} uses a non-manual algorithm but has no algorithm name")]
    MissingAlgorithmName { number: SegmentNumber },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub number: SegmentNumber,
    pub label: String,
    pub category: Option<CodedConcept>,
    pub property_type: Option<CodedConcept>,
    pub modifier: Option<CodedConcept>,
    pub algorithm_type: AlgorithmType,
    pub algorithm_name: Option<String>,
    /// Persisted color. Lookup table entries are derived from it.
    pub display_color: Option<DicomLab>,
    pub visible: bool,
}

impl Segment {
    /// A segment with nothing known about it beyond its number.
    pub fn unlabeled(number: SegmentNumber) -> Self {
        Self {
            number,
            label: DEFAULT_LABEL.to_string(),
            category: None,
            property_type: None,
            modifier: None,
            algorithm_type: AlgorithmType::Manual,
            algorithm_name: None,
            display_color: None,
            visible: true,
        }
    }

    /// Codes of one of the three coded properties.
    pub fn coded(&self, field: CodedField) -> Option<&CodedConcept> {
        match field {
            CodedField::Category => self.category.as_ref(),
            CodedField::Type => self.property_type.as_ref(),
            CodedField::Modifier => self.modifier.as_ref(),
        }
    }

    /// Short "category - type - modifier" description of whatever is set.
    pub fn description(&self) -> String {
        [&self.category, &self.property_type, &self.modifier]
            .into_iter()
            .flatten()
            .map(|c| c.meaning.as_str())
            .collect::<Vec<_>>()
            .join(" - ")
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.number == BACKGROUND {
            return Err(RegistryError::ReservedSegmentNumber);
        }
        let has_name = self
            .algorithm_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty());
        if self.algorithm_type.requires_name() && !has_name {
            return Err(RegistryError::MissingAlgorithmName {
                number: self.number,
            });
        }
        Ok(())
    }
}

/// New coded properties and label for an existing segment. `None` clears a
/// property; a blank label is replaced by [`default_label`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relabel {
    pub category: Option<CodedConcept>,
    pub property_type: Option<CodedConcept>,
    pub modifier: Option<CodedConcept>,
    pub label: Option<String>,
}

/// `"{category} - {type} - {modifier}"`, with `"other"` for a missing
/// category or type and the segment number for a missing modifier.
pub fn default_label(
    category: Option<&CodedConcept>,
    property_type: Option<&CodedConcept>,
    modifier: Option<&CodedConcept>,
    number: SegmentNumber,
) -> String {
    let part = |concept: Option<&CodedConcept>, fallback: String| {
        concept
            .map(|c| c.meaning.trim().to_string())
            .unwrap_or(fallback)
    };
    format!(
        "{} - {} - {}",
        part(category, "other".to_string()),
        part(property_type, "other".to_string()),
        part(modifier, number.to_string()),
    )
}

/// Segments of one label volume keyed by number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentRegistry {
    segments: BTreeMap<SegmentNumber, Segment>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, number: SegmentNumber) -> Option<&Segment> {
        self.segments.get(&number)
    }

    pub fn get_mut(&mut self, number: SegmentNumber) -> Option<&mut Segment> {
        self.segments.get_mut(&number)
    }

    pub fn contains(&self, number: SegmentNumber) -> bool {
        self.segments.contains_key(&number)
    }

    /// Adds or replaces a segment after checking it.
    pub fn insert(&mut self, segment: Segment) -> Result<Option<Segment>, RegistryError> {
        segment.validate()?;
        Ok(self.segments.insert(segment.number, segment))
    }

    /// Returns the segment, registering an unlabeled one first if needed.
    pub fn ensure_default(&mut self, number: SegmentNumber) -> Result<&mut Segment, RegistryError> {
        if number == BACKGROUND {
            return Err(RegistryError::ReservedSegmentNumber);
        }
        Ok(self
            .segments
            .entry(number)
            .or_insert_with(|| Segment::unlabeled(number)))
    }

    pub fn relabel(
        &mut self,
        number: SegmentNumber,
        relabel: Relabel,
    ) -> Result<&Segment, RegistryError> {
        let segment = self.ensure_default(number)?;
        let label = match relabel.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => default_label(
                relabel.category.as_ref(),
                relabel.property_type.as_ref(),
                relabel.modifier.as_ref(),
                number,
            ),
        };
        segment.category = relabel.category;
        segment.property_type = relabel.property_type;
        segment.modifier = relabel.modifier;
        segment.label = label;
        Ok(&*segment)
    }

    pub fn remove(&mut self, number: SegmentNumber) -> Option<Segment> {
        self.segments.remove(&number)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments in ascending number order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn numbers(&self) -> impl Iterator<Item = SegmentNumber> + '_ {
        self.segments.keys().copied()
    }

    /// Numbers of segments currently suppressed from rendering.
    pub fn hidden(&self) -> impl Iterator<Item = SegmentNumber> + '_ {
        self.segments
            .values()
            .filter(|s| !s.visible)
            .map(|s| s.number)
    }

    pub fn max_number(&self) -> Option<SegmentNumber> {
        self.segments.keys().next_back().copied()
    }
}

/// How far a segment's classification has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Unlabeled,
    CategoryChosen,
    TypeChosen,
    ModifierChosen,
}

/// Category/type/modifier picked while relabeling a segment.
///
/// Types and modifiers are scoped under their parent, so changing a parent
/// clears its children. Choosing the selected entry again deselects it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelabelSelection {
    pub category: Option<CodedConcept>,
    pub property_type: Option<CodedConcept>,
    pub modifier: Option<CodedConcept>,
}

impl RelabelSelection {
    /// Restores the selection from a segment's stored codes. Codes missing
    /// from the catalog are left unselected and reported.
    pub fn from_segment(
        segment: &Segment,
        catalog: &CodingCatalog,
    ) -> (Self, Vec<(CodedField, String)>) {
        let found = catalog.match_codes(
            segment.category.as_ref(),
            segment.property_type.as_ref(),
            segment.modifier.as_ref(),
        );
        let selection = Self {
            category: found.category.map(|c| c.concept.clone()),
            property_type: found.property_type.map(|t| t.concept.clone()),
            modifier: found.modifier.cloned(),
        };
        (selection, found.unmatched)
    }

    pub fn state(&self) -> SelectionState {
        match (&self.category, &self.property_type, &self.modifier) {
            (_, Some(_), Some(_)) => SelectionState::ModifierChosen,
            (_, Some(_), None) => SelectionState::TypeChosen,
            (Some(_), None, _) => SelectionState::CategoryChosen,
            (None, None, _) => SelectionState::Unlabeled,
        }
    }

    pub fn choose_category(&mut self, category: CodedConcept) {
        let reselected = self
            .category
            .as_ref()
            .is_some_and(|current| current.same_code(&category));
        self.category = if reselected { None } else { Some(category) };
        self.property_type = None;
        self.modifier = None;
    }

    /// Selects a type together with the category it was listed under.
    pub fn choose_type(&mut self, category: CodedConcept, property_type: CodedConcept) {
        let reselected = self
            .property_type
            .as_ref()
            .is_some_and(|current| current.same_code(&property_type));
        if reselected {
            self.property_type = None;
        } else {
            self.property_type = Some(property_type);
            self.category = Some(category);
        }
        self.modifier = None;
    }

    pub fn choose_modifier(&mut self, modifier: CodedConcept) {
        let reselected = self
            .modifier
            .as_ref()
            .is_some_and(|current| current.same_code(&modifier));
        self.modifier = if reselected { None } else { Some(modifier) };
    }

    pub fn default_label(&self, number: SegmentNumber) -> String {
        default_label(
            self.category.as_ref(),
            self.property_type.as_ref(),
            self.modifier.as_ref(),
            number,
        )
    }

    pub fn into_relabel(self, label: Option<String>) -> Relabel {
        Relabel {
            category: self.category,
            property_type: self.property_type,
            modifier: self.modifier,
            label,
        }
    }
}
