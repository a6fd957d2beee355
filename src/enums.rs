use std::fmt;

/// How a segment was produced, as recorded in Segment Algorithm Type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AlgorithmType {
    #[default]
    Manual,
    SemiAutomatic,
    Automatic,
}

impl AlgorithmType {
    pub fn as_dicom_str(&self) -> &'static str {
        match self {
            AlgorithmType::Manual => "MANUAL",
            AlgorithmType::SemiAutomatic => "SEMIAUTOMATIC",
            AlgorithmType::Automatic => "AUTOMATIC",
        }
    }

    /// Parse a Segment Algorithm Type value. Unknown values yield `None`.
    pub fn from_dicom_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => Some(AlgorithmType::Manual),
            "SEMIAUTOMATIC" => Some(AlgorithmType::SemiAutomatic),
            "AUTOMATIC" => Some(AlgorithmType::Automatic),
            _ => None,
        }
    }

    pub fn requires_name(&self) -> bool {
        !matches!(self, AlgorithmType::Manual)
    }
}

/// The three coded properties attached to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodedField {
    Category,
    Type,
    Modifier,
}

impl fmt::Display for CodedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wording used by the relabel dialog
        let name = match self {
            CodedField::Category => "category",
            CodedField::Type => "property",
            CodedField::Modifier => "modifier",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Loaded,
    Loading,
    Failed,
}

#[derive(Default)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
