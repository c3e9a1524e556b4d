pub mod config;
pub mod consolidate;
pub mod docx;
pub mod engine;
mod error;
pub mod images;
pub mod model;
pub mod package;
pub mod report;
pub mod resolve;
pub mod rewrite;
pub mod scope;
pub mod xlsx;
mod xml;

pub use config::MergeConfig;
pub use docx::DocxFile;
pub use engine::{UnitOutcome, apply_text_and_image_replacements};
pub use error::Error;
pub use images::{ImagePlaceholder, ImagePlaceholderMap, SizePolicy};
pub use report::{Failure, FailureKind, ProcessingReport};
pub use resolve::TokenMap;
pub use scope::{ScopePath, ScopeWalker};
pub use xlsx::XlsxFile;

use std::path::Path;

/// A template of either supported kind, chosen by file extension.
#[derive(Clone, Debug)]
pub enum TemplateFile {
    Docx(DocxFile),
    Xlsx(XlsxFile),
}

impl TemplateFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("docx") => Ok(TemplateFile::Docx(DocxFile::open(path)?)),
            Some("xlsx") => Ok(TemplateFile::Xlsx(XlsxFile::open(path)?)),
            _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn apply(&mut self, tokens: &TokenMap, images: &ImagePlaceholderMap) -> ProcessingReport {
        match self {
            TemplateFile::Docx(file) => apply_text_and_image_replacements(&mut file.document, tokens, images),
            TemplateFile::Xlsx(file) => apply_text_and_image_replacements(&mut file.workbook, tokens, images),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        match self {
            TemplateFile::Docx(file) => file.save(path),
            TemplateFile::Xlsx(file) => file.save(path),
        }
    }
}

/// Opens `input`, applies the replacements and writes the result to
/// `output`, which must not be the template itself.
pub fn merge_file(
    input: &Path,
    output: &Path,
    tokens: &TokenMap,
    images: &ImagePlaceholderMap,
) -> Result<ProcessingReport, Error> {
    if input == output {
        return Err(Error::SamePath(output.to_path_buf()));
    }
    let mut template = TemplateFile::open(input)?;
    let report = template.apply(tokens, images);
    log::info!("{}: {report}", input.display());
    template.save(output)?;
    Ok(report)
}
