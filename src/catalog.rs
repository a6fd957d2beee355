//! Read-only table of coded segment properties.
//!
//! The table is nested: each category scopes its property types, and each
//! type scopes its modifiers. A bundled table covering common anatomy, tissue
//! and findings is used unless the host supplies its own.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{config::ConfigError, enums::CodedField};

const BUNDLED_SEG_CODES: &str = include_str!("seg_codes.json");

/// A coded entry: Code Value, Coding Scheme Designator and Code Meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodedConcept {
    pub code: String,
    pub scheme: String,
    pub meaning: String,
}

impl CodedConcept {
    pub fn new(
        code: impl Into<String>,
        scheme: impl Into<String>,
        meaning: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            scheme: scheme.into(),
            meaning: meaning.into(),
        }
    }

    /// Local "Other" code used for segments nobody has classified yet.
    pub fn other() -> Self {
        Self::new("999000", "L", "Other")
    }

    /// Same code in the same scheme. Meanings are free text and not compared.
    pub fn same_code(&self, other: &CodedConcept) -> bool {
        self.code == other.code && self.scheme == other.scheme
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogType {
    #[serde(flatten)]
    pub concept: CodedConcept,
    #[serde(default)]
    pub modifiers: Vec<CodedConcept>,
}

impl CatalogType {
    pub fn find_modifier(&self, concept: &CodedConcept) -> Option<&CodedConcept> {
        self.modifiers.iter().find(|m| m.same_code(concept))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCategory {
    #[serde(flatten)]
    pub concept: CodedConcept,
    #[serde(default)]
    pub types: Vec<CatalogType>,
}

impl CatalogCategory {
    pub fn find_type(&self, concept: &CodedConcept) -> Option<&CatalogType> {
        self.types.iter().find(|t| t.concept.same_code(concept))
    }
}

/// Result of looking a segment's codes up in the catalog.
#[derive(Debug, Default)]
pub struct CatalogMatch<'a> {
    pub category: Option<&'a CatalogCategory>,
    pub property_type: Option<&'a CatalogType>,
    pub modifier: Option<&'a CodedConcept>,
    /// Codes that were present but had no catalog entry, with their meaning.
    pub unmatched: Vec<(CodedField, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodingCatalog {
    categories: Vec<CatalogCategory>,
}

impl CodingCatalog {
    pub fn new(categories: Vec<CatalogCategory>) -> Self {
        Self { categories }
    }

    /// The catalog shipped with the crate.
    pub fn bundled() -> Self {
        Self::from_json_str(BUNDLED_SEG_CODES).unwrap_or_else(|err| {
            error!(%err, "bundled coding catalog is malformed");
            Self::default()
        })
    }

    pub fn from_json_str(json_text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json_text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn categories(&self) -> &[CatalogCategory] {
        &self.categories
    }

    pub fn find_category(&self, concept: &CodedConcept) -> Option<&CatalogCategory> {
        self.categories.iter().find(|c| c.concept.same_code(concept))
    }

    /// Category that owns a type, looked up by the type's code.
    pub fn parent_category(&self, type_concept: &CodedConcept) -> Option<&CatalogCategory> {
        self.categories
            .iter()
            .find(|c| c.find_type(type_concept).is_some())
    }

    /// Every (category, type) pair, optionally restricted to one category.
    /// A type listed under several categories appears once per category.
    pub fn types_under<'a>(
        &'a self,
        category: Option<&'a CodedConcept>,
    ) -> impl Iterator<Item = (&'a CatalogCategory, &'a CatalogType)> + 'a {
        self.categories
            .iter()
            .filter(move |c| category.is_none_or(|wanted| c.concept.same_code(wanted)))
            .flat_map(|c| c.types.iter().map(move |t| (c, t)))
    }

    /// Resolves a segment's codes. The type is only searched under a matched
    /// category, and the modifier only under a matched type, so a code that
    /// exists elsewhere in the table still counts as unmatched.
    pub fn match_codes(
        &self,
        category: Option<&CodedConcept>,
        property_type: Option<&CodedConcept>,
        modifier: Option<&CodedConcept>,
    ) -> CatalogMatch<'_> {
        let mut result = CatalogMatch::default();

        if let Some(category) = category {
            result.category = self.find_category(category);
            if result.category.is_none() {
                result
                    .unmatched
                    .push((CodedField::Category, category.meaning.clone()));
            }
        }

        if let Some(property_type) = property_type {
            result.property_type = result.category.and_then(|c| c.find_type(property_type));
            if result.property_type.is_none() {
                result
                    .unmatched
                    .push((CodedField::Type, property_type.meaning.clone()));
            }
        }

        if let Some(modifier) = modifier {
            result.modifier = result.property_type.and_then(|t| t.find_modifier(modifier));
            if result.modifier.is_none() {
                result
                    .unmatched
                    .push((CodedField::Modifier, modifier.meaning.clone()));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn liver() -> CodedConcept {
        CodedConcept::new("10200004", "SCT", "Liver")
    }

    fn anatomy() -> CodedConcept {
        CodedConcept::new("123037004", "SCT", "Anatomical Structure")
    }

    #[test]
    fn bundled_catalog_parses() {
        let catalog = CodingCatalog::bundled();
        assert!(catalog.categories().len() >= 4);
        assert!(catalog.find_category(&CodedConcept::other()).is_some());
    }

    #[test]
    fn type_is_found_under_its_category() {
        let catalog = CodingCatalog::bundled();
        let found = catalog.match_codes(Some(&anatomy()), Some(&liver()), None);
        assert!(found.unmatched.is_empty());
        assert_eq!(found.property_type.unwrap().concept.meaning, "Liver");
    }

    #[test]
    fn type_under_the_wrong_category_is_unmatched() {
        let catalog = CodingCatalog::bundled();
        let found = catalog.match_codes(Some(&CodedConcept::other()), Some(&liver()), None);
        assert_eq!(found.unmatched, vec![(CodedField::Type, "Liver".to_string())]);
    }

    #[test]
    fn meaning_is_not_part_of_the_match() {
        let catalog = CodingCatalog::bundled();
        let renamed = CodedConcept::new("123037004", "SCT", "anatomy");
        assert!(catalog.find_category(&renamed).is_some());
    }

    #[test]
    fn modifiers_are_scoped_under_the_type() {
        let catalog = CodingCatalog::bundled();
        let left = CodedConcept::new("7771000", "SCT", "Left");
        let kidney = CodedConcept::new("64033007", "SCT", "Kidney");
        let found = catalog.match_codes(Some(&anatomy()), Some(&kidney), Some(&left));
        assert!(found.unmatched.is_empty());

        let found = catalog.match_codes(Some(&anatomy()), Some(&liver()), Some(&left));
        assert_eq!(found.unmatched, vec![(CodedField::Modifier, "Left".to_string())]);
    }

    #[test]
    fn parent_category_of_a_type() {
        let catalog = CodingCatalog::bundled();
        let parent = catalog.parent_category(&liver()).unwrap();
        assert!(parent.concept.same_code(&anatomy()));
        assert_eq!(catalog.types_under(Some(&anatomy())).count(), 6);
    }
}
