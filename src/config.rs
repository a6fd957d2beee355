use std::{fs, path::Path, path::PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::color::Palette;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session-wide settings. Every field has a default, so a partial JSON
/// document such as `{"manufacturer": "Lab"}` is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Manufacturer stamped on encoded objects when the volume has none.
    pub manufacturer: String,
    /// Image Comments stamped on encoded objects when the volume has none.
    pub image_comments: String,
    /// Algorithm name recorded for segments created by hand.
    pub default_algorithm_name: String,
    pub palette: Palette,
    /// Coding catalog to load instead of the bundled one.
    pub catalog_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            manufacturer: env!("CARGO_PKG_NAME").to_string(),
            image_comments: "RESEARCH".to_string(),
            default_algorithm_name: "user created".to_string(),
            palette: Palette::default(),
            catalog_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json_text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json_text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = SessionConfig::from_json_str(r#"{"manufacturer": "Lab"}"#).unwrap();
        assert_eq!(config.manufacturer, "Lab");
        assert_eq!(config.image_comments, "RESEARCH");
        assert_eq!(config.palette, Palette::default());
    }

    #[test]
    fn palette_overrides_are_read() {
        let config =
            SessionConfig::from_json_str(r#"{"palette": {"saturation": 0.5}}"#).unwrap();
        assert_eq!(config.palette.saturation, 0.5);
        assert_eq!(config.palette.value, Palette::default().value);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            SessionConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
    }
}
