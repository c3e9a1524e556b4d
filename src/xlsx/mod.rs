//! SpreadsheetML backend: text cells of every sheet become units; pictures
//! anchored in a sheet's drawing attach to their anchor cell.

mod read;
mod write;

use std::path::Path;

use crate::error::Error;
use crate::model::Workbook;
use crate::package::{Package, REL_OFFICE_DOCUMENT, Relationships, resolve_target};

pub(crate) const SML_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
pub(crate) const XDR_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing";

#[derive(Clone, Debug)]
pub(crate) struct DrawingPart {
    pub(crate) name: String,
    pub(crate) xml: String,
    /// Qualified-name prefix of the drawing elements, `"xdr:"` or empty.
    pub(crate) prefix: String,
    pub(crate) max_id: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct SheetPart {
    pub(crate) name: String,
    pub(crate) xml: String,
    pub(crate) drawing: Option<DrawingPart>,
}

/// A `.xlsx` template: its model plus everything needed to save it again.
#[derive(Clone, Debug)]
pub struct XlsxFile {
    pub workbook: Workbook,
    package: Package,
    sheets: Vec<SheetPart>,
}

impl XlsxFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let package = Package::open(path)?;
        let workbook_part = Relationships::load(&package, "")?
            .first_of_type(REL_OFFICE_DOCUMENT)
            .map(|r| resolve_target("", &r.target))
            .unwrap_or_else(|| "xl/workbook.xml".to_string());
        let loaded = read::load(&package, &workbook_part)?;
        log::info!(
            "Loaded {}: {} sheets, {} text cells",
            path.display(),
            loaded.workbook.sheets.len(),
            loaded.workbook.sheets.iter().map(|s| s.cells.len()).sum::<usize>()
        );
        Ok(XlsxFile {
            workbook: loaded.workbook,
            package,
            sheets: loaded.sheets,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut package = self.package.clone();
        write::write_back(self, &mut package)?;
        package.save(path)
    }
}

/// Prefix of the root element's qualified name, with its colon.
fn root_prefix(xml: &str, root: roxmltree::Node) -> String {
    let start = root.range().start + 1;
    let name_len = xml[start..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(0);
    match xml[start..start + name_len].split_once(':') {
        Some((prefix, _)) => format!("{prefix}:"),
        None => String::new(),
    }
}
