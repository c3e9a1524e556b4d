//! JSON merge configuration: token values, regex tokens and image
//! placeholders, in declaration order.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::Error;
use crate::images::{ImagePlaceholder, ImagePlaceholderMap, SizePolicy};
use crate::model::Extent;
use crate::resolve::TokenMap;

/// Size used for an image entry that names no size, in centimetres.
pub const DEFAULT_IMAGE_SIZE_CM: (f64, f64) = (3.5, 1.5);

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub replacements: IndexMap<String, String>,
    #[serde(default)]
    pub patterns: IndexMap<String, String>,
    #[serde(default)]
    pub image_replacements: IndexMap<String, ImageSpec>,
    #[serde(default = "default_true")]
    pub replace_existing_images: bool,
    /// Directory relative image paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ImageSpec {
    Path(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default)]
        width_cm: Option<f64>,
        #[serde(default)]
        height_cm: Option<f64>,
        #[serde(default)]
        width_pixels: Option<f64>,
        #[serde(default)]
        height_pixels: Option<f64>,
        #[serde(default)]
        maintain_aspect: bool,
    },
}

impl ImageSpec {
    pub fn path(&self) -> &Path {
        match self {
            ImageSpec::Path(path) | ImageSpec::Detailed { path, .. } => path,
        }
    }

    pub fn size_policy(&self) -> Result<SizePolicy, String> {
        let default = SizePolicy::Fixed(Extent::from_cm(DEFAULT_IMAGE_SIZE_CM.0, DEFAULT_IMAGE_SIZE_CM.1));
        let ImageSpec::Detailed {
            width_cm,
            height_cm,
            width_pixels,
            height_pixels,
            maintain_aspect,
            ..
        } = *self
        else {
            return Ok(default);
        };
        let size = match (width_pixels, height_pixels, width_cm, height_cm) {
            (Some(w), Some(h), _, _) => Some(Extent::from_pixels(w, h)),
            (None, None, Some(w), Some(h)) => Some(Extent::from_cm(w, h)),
            (None, None, None, None) => None,
            _ => return Err("width and height must be given together".into()),
        };
        if size.is_some_and(|s| s.is_empty()) {
            return Err("image size must be positive".into());
        }
        Ok(match (size, maintain_aspect) {
            (Some(size), true) => SizePolicy::AspectFit(size),
            (Some(size), false) => SizePolicy::Fixed(size),
            (None, true) => SizePolicy::InheritOriginal,
            (None, false) => default,
        })
    }
}

impl MergeConfig {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        let mut config = MergeConfig::from_json(&json)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        log::debug!(
            "Loaded {}: {} replacements, {} patterns, {} images",
            path.display(),
            config.replacements.len(),
            config.patterns.len(),
            config.image_replacements.len()
        );
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Literal replacements first, then regex patterns, each in declaration order.
    pub fn token_map(&self) -> Result<TokenMap, Error> {
        let mut builder = TokenMap::builder();
        for (key, value) in &self.replacements {
            builder = builder.literal(key, value);
        }
        for (pattern, value) in &self.patterns {
            builder = builder.pattern(pattern, value);
        }
        builder.build()
    }

    pub fn image_map(&self) -> Result<ImagePlaceholderMap, Error> {
        let mut entries = Vec::with_capacity(self.image_replacements.len());
        for (marker, spec) in &self.image_replacements {
            let size = spec
                .size_policy()
                .map_err(|reason| Error::Config(format!("image {marker:?}: {reason}")))?;
            entries.push(ImagePlaceholder::new(marker, self.base_dir.join(spec.path()), size));
        }
        Ok(ImagePlaceholderMap::new(entries)?.with_replace_existing(self.replace_existing_images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_in_declaration_order() {
        let config = MergeConfig::from_json(
            r#"{
                "replacements": {"{{Z}}": "last", "{{A}}": "first"},
                "patterns": {"\\{\\{DATE:[^}]*\\}\\}": "2026-10-19"},
                "image_replacements": {
                    "{{LOGO}}": "logo.png",
                    "{{SIGN}}": {"path": "sig.png", "width_cm": 4.0, "height_cm": 2.0, "maintain_aspect": true},
                    "{{PX}}": {"path": "px.png", "width_pixels": 96, "height_pixels": 48},
                    "{{KEEP}}": {"path": "keep.png", "maintain_aspect": true}
                },
                "replace_existing_images": false
            }"#,
        )
        .unwrap();
        let keys: Vec<_> = config.replacements.keys().map(String::as_str).collect();
        assert_eq!(keys, ["{{Z}}", "{{A}}"]);
        assert_eq!(config.token_map().unwrap().len(), 3);

        let images = config.image_map().unwrap();
        assert!(!images.replace_existing());
        let sizes: Vec<_> = images.entries().iter().map(|e| e.size).collect();
        assert_eq!(
            sizes,
            vec![
                SizePolicy::Fixed(Extent::from_cm(3.5, 1.5)),
                SizePolicy::AspectFit(Extent::from_cm(4.0, 2.0)),
                SizePolicy::Fixed(Extent::from_cm(2.54, 1.27)),
                SizePolicy::InheritOriginal,
            ]
        );
    }

    #[test]
    fn defaults_and_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.json");
        fs::write(&path, r#"{"image_replacements": {"{{LOGO}}": {"path": "img/logo.png"}}}"#).unwrap();
        let config = MergeConfig::from_path(&path).unwrap();
        assert!(config.replace_existing_images);
        assert!(config.token_map().unwrap().is_empty());
        let images = config.image_map().unwrap();
        assert_eq!(images.entries()[0].path, dir.path().join("img/logo.png"));
        assert_eq!(images.entries()[0].size, SizePolicy::Fixed(Extent::from_cm(3.5, 1.5)));
    }

    #[test]
    fn rejects_half_sizes_and_unknown_fields() {
        let config =
            MergeConfig::from_json(r#"{"image_replacements": {"{{X}}": {"path": "x.png", "width_cm": 3}}}"#)
                .unwrap();
        assert!(matches!(config.image_map(), Err(Error::Config(_))));
        assert!(matches!(
            MergeConfig::from_json(r#"{"replacement": {}}"#),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            MergeConfig::from_json(r#"{"patterns": {"(": "x"}}"#).unwrap().token_map(),
            Err(Error::Pattern(_))
        ));
    }
}
