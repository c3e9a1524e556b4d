use crate::consolidate::{Consolidated, IMAGE_SENTINEL, consolidate};
use crate::images::{ExistingImageCursor, ImageEdit, ImageLoader, ImagePlaceholderMap, resolve_images};
use crate::model::{ImageSource, ImageSpan, Unit};
use crate::report::{FailureKind, ProcessingReport};
use crate::resolve::{TextEdit, TokenMap, segments};
use crate::rewrite::{Edit, Replacement, commit, rebuild};
use crate::scope::{ScopePath, ScopeWalker};

/// Where a unit ended up after its single visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    NoChange,
    Rewritten,
    Failed,
}

/// Substitutes tokens and images in every unit of `target`, in walk order.
///
/// Each unit is visited once. A unit either keeps its exact content or
/// receives its complete rewrite; failures are recorded in the report and
/// never stop the pass.
pub fn apply_text_and_image_replacements<T>(
    target: &mut T,
    tokens: &TokenMap,
    images: &ImagePlaceholderMap,
) -> ProcessingReport
where
    T: ScopeWalker + ?Sized,
{
    let mut pass = Pass {
        tokens,
        images,
        cursor: images.cursor(),
        loader: ImageLoader::new(),
        report: ProcessingReport::default(),
    };
    for (path, unit) in target.walk() {
        let outcome = pass.visit(&path, unit);
        log::debug!("{path}: {outcome:?}");
    }
    pass.report
}

/// State for one invocation: the existing-picture cursor and the image cache
/// never outlive it.
struct Pass<'a> {
    tokens: &'a TokenMap,
    images: &'a ImagePlaceholderMap,
    cursor: ExistingImageCursor<'a>,
    loader: ImageLoader,
    report: ProcessingReport,
}

impl<'a> Pass<'a> {
    fn visit(&mut self, path: &ScopePath, unit: &mut Unit) -> UnitOutcome {
        self.report.units_scanned += 1;

        if let Some(unsupported) = unit.unsupported_content() {
            if self.tokens.mentions(&unsupported.text) || self.images.mentions(&unsupported.text) {
                let reason = unsupported.reason.clone();
                self.report
                    .fail(path.clone(), FailureKind::UnitStructureUnsupported, reason);
                return UnitOutcome::Failed;
            }
            return UnitOutcome::NoChange;
        }

        let consolidated = consolidate(unit);
        let image_edits = resolve_images(unit, &consolidated, self.images, &mut self.cursor);
        let text_edits = self.text_edits(&consolidated, &image_edits);
        if text_edits.is_empty() && image_edits.is_empty() {
            return UnitOutcome::NoChange;
        }

        let Some(edits) = self.load_images(path, &text_edits, &image_edits) else {
            return UnitOutcome::Failed;
        };
        let spans = rebuild(unit, &consolidated, &edits);
        if let Err(e) = commit(unit, spans) {
            self.report
                .fail(path.clone(), FailureKind::BackendWriteFailure, e.reason);
            return UnitOutcome::Failed;
        }

        self.report.units_rewritten += 1;
        self.report.text_substitutions_applied += text_edits.len();
        self.report.images_replaced += image_edits.len();
        UnitOutcome::Rewritten
    }

    /// Token matches in the text that is neither a picture nor an image marker.
    fn text_edits(&self, consolidated: &Consolidated, image_edits: &[ImageEdit<'_>]) -> Vec<TextEdit> {
        let blocked: Vec<_> = image_edits
            .iter()
            .filter_map(|e| match e {
                ImageEdit::Marker { range, .. } => Some(range.clone()),
                ImageEdit::Existing { .. } => None,
            })
            .collect();
        let mut edits = Vec::new();
        for segment in segments(&consolidated.text, &blocked) {
            self.tokens.find_edits(&consolidated.text, segment, &mut edits);
        }
        edits
    }

    /// Turns matches into edits, reading every image they need. Returns
    /// `None` after recording a failure per unusable image.
    fn load_images(
        &mut self,
        path: &ScopePath,
        text_edits: &[TextEdit],
        image_edits: &[ImageEdit<'_>],
    ) -> Option<Vec<Edit>> {
        let mut edits: Vec<Edit> = text_edits
            .iter()
            .map(|e| Edit {
                range: e.range.clone(),
                replacement: Replacement::Text(e.replacement.clone()),
            })
            .collect();
        let mut missing = Vec::new();

        for image_edit in image_edits {
            let placeholder = image_edit.placeholder();
            let data = match self.loader.load(&placeholder.path) {
                Ok(data) => data,
                Err(reason) => {
                    missing.push(format!("{}: {reason}", placeholder.marker));
                    continue;
                }
            };
            let extent = placeholder.size.extent_for(&data, image_edit.original());
            let source = ImageSource::Inserted(data);
            edits.push(match image_edit {
                ImageEdit::Marker { range, .. } => Edit {
                    range: range.clone(),
                    replacement: Replacement::Insert(ImageSpan::new(source, extent)),
                },
                ImageEdit::Existing { offset, .. } => Edit {
                    range: *offset..*offset + IMAGE_SENTINEL.len_utf8(),
                    replacement: Replacement::Refill { source, extent },
                },
            });
        }

        if missing.is_empty() {
            return Some(edits);
        }
        for reason in missing {
            self.report
                .fail(path.clone(), FailureKind::MissingResource, reason);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImagePlaceholder, SizePolicy};
    use crate::model::{Block, Document, Extent, FormatDescriptor, Span};

    fn doc(paragraphs: Vec<Unit>) -> Document {
        Document {
            body: paragraphs.into_iter().map(Block::Paragraph).collect(),
            sections: vec![],
        }
    }

    fn plain(text: &str) -> Unit {
        Unit::paragraph(vec![Span::text(text, FormatDescriptor::default())])
    }

    #[test]
    fn counts_substitutions_and_leaves_other_units_alone() {
        let mut d = doc(vec![plain("{{A}} and {{A}}"), plain("nothing")]);
        let untouched = d.clone();
        let tokens = TokenMap::from_literals([("{{A}}", "a")]).unwrap();
        let report = apply_text_and_image_replacements(&mut d, &tokens, &ImagePlaceholderMap::default());
        assert_eq!(report.units_scanned, 2);
        assert_eq!(report.units_rewritten, 1);
        assert_eq!(report.text_substitutions_applied, 2);
        assert_eq!(d.all_units()[0].text(), "a and a");
        assert_eq!(d.body[1], untouched.body[1]);
    }

    #[test]
    fn missing_image_fails_whole_unit() {
        let mut d = doc(vec![plain("{{A}} {{LOGO}}"), plain("{{A}}")]);
        let before = d.clone();
        let tokens = TokenMap::from_literals([("{{A}}", "a")]).unwrap();
        let images = ImagePlaceholderMap::new(vec![ImagePlaceholder::new(
            "{{LOGO}}",
            "/no/such/logo.png",
            SizePolicy::Fixed(Extent::from_cm(1.0, 1.0)),
        )])
        .unwrap();
        let report = apply_text_and_image_replacements(&mut d, &tokens, &images);
        assert_eq!(d.body[0], before.body[0]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::MissingResource);
        assert_eq!(report.failures[0].location.to_string(), "body/p[0]");
        assert_eq!(report.units_rewritten, 1);
    }

    #[test]
    fn rejected_commit_reverts_unit() {
        let mut d = doc(vec![plain("{{A}}")]);
        let before = d.clone();
        let tokens = TokenMap::from_literals([("{{A}}", "bell\u{7}")]).unwrap();
        let report = apply_text_and_image_replacements(&mut d, &tokens, &ImagePlaceholderMap::default());
        assert_eq!(d, before);
        assert_eq!(report.failures[0].kind, FailureKind::BackendWriteFailure);
        assert_eq!(report.units_rewritten, 0);
    }

    #[test]
    fn unsupported_units_fail_only_when_they_mention_a_key() {
        let mut d = doc(vec![
            Unit::unsupported(crate::model::UnitKind::Paragraph, "hyperlink", "see {{A}}"),
            Unit::unsupported(crate::model::UnitKind::Paragraph, "hyperlink", "see docs"),
        ]);
        let tokens = TokenMap::from_literals([("{{A}}", "a")]).unwrap();
        let report = apply_text_and_image_replacements(&mut d, &tokens, &ImagePlaceholderMap::default());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::UnitStructureUnsupported);
        assert_eq!(report.units_scanned, 2);
    }

    #[test]
    fn image_markers_take_precedence_over_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let logo = dir.path().join("logo.png");
        image::RgbImage::new(4, 2).save(&logo).unwrap();
        let mut d = doc(vec![plain("x{{LOGO}}y")]);
        let tokens = TokenMap::from_literals([("{{LOGO}}", "text"), ("y", "Y")]).unwrap();
        let images = ImagePlaceholderMap::new(vec![ImagePlaceholder::new(
            "{{LOGO}}",
            &logo,
            SizePolicy::InheritOriginal,
        )])
        .unwrap();
        let report = apply_text_and_image_replacements(&mut d, &tokens, &images);
        assert_eq!(report.images_replaced, 1);
        assert_eq!(report.text_substitutions_applied, 1);
        let unit = d.all_units()[0];
        assert_eq!(unit.text(), "xY");
        let picture = unit.images().next().unwrap();
        assert_eq!(picture.extent, Extent::from_pixels(4.0, 2.0));
    }
}
