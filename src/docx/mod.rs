//! WordprocessingML backend: loads a `.docx` into a [`Document`] and writes
//! rewritten paragraphs back into the original part XML.

mod read;
mod write;

use std::path::Path;

use crate::error::Error;
use crate::model::Document;
use crate::package::{Package, REL_OFFICE_DOCUMENT, Relationships};

pub(crate) const WML_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
pub(crate) const WPD_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing";

/// One XML part the document model was read from.
#[derive(Clone, Debug)]
pub(crate) struct XmlPart {
    pub(crate) name: String,
    pub(crate) xml: String,
}

/// A `.docx` template: its model plus everything needed to save it again.
#[derive(Clone, Debug)]
pub struct DocxFile {
    pub document: Document,
    package: Package,
    parts: Vec<XmlPart>,
    max_drawing_id: u32,
}

impl DocxFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let package = Package::open(path)?;
        let main_part = Relationships::load(&package, "")?
            .first_of_type(REL_OFFICE_DOCUMENT)
            .map(|r| crate::package::resolve_target("", &r.target))
            .unwrap_or_else(|| "word/document.xml".to_string());
        let loaded = read::load(&package, &main_part)?;
        log::info!(
            "Loaded {}: {} sections, {} parts",
            path.display(),
            loaded.document.sections.len(),
            loaded.parts.len()
        );
        Ok(DocxFile {
            document: loaded.document,
            package,
            parts: loaded.parts,
            max_drawing_id: loaded.max_drawing_id,
        })
    }

    /// Writes the document to `path`; parts without rewritten units are
    /// copied byte for byte.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut package = self.package.clone();
        write::write_back(self, &mut package)?;
        package.save(path)
    }
}

fn wml<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<roxmltree::Node<'a, 'a>> {
    crate::xml::child(node, WML_NS, name)
}

fn wml_attr<'a>(node: roxmltree::Node<'a, 'a>, child: &str) -> Option<&'a str> {
    wml(node, child).and_then(|n| n.attribute((WML_NS, "val")))
}

fn is_wml(node: roxmltree::Node, name: &str) -> bool {
    crate::xml::is(node, WML_NS, name)
}
