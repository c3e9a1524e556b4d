use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

pub const EMU_PER_CM: f64 = 360_000.0;
/// 914400 EMU per inch at the fixed 96 DPI device assumption.
pub const EMU_PER_PIXEL: f64 = 9_525.0;

/// Excel refuses cells holding more text than this.
pub const MAX_CELL_CHARS: usize = 32_767;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Center,
    Right,
    Justify,
}

/// Character formatting of a text span. `None` means "inherit the document default".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FormatDescriptor {
    pub font_name: Option<String>,
    pub font_size: Option<f32>, // points
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub underline: Option<bool>,
    pub color: Option<[u8; 3]>,
    /// Backend run-property markup this descriptor was read from. Writers emit
    /// it verbatim so properties without a typed field survive a rewrite.
    pub native: Option<String>,
}

impl FormatDescriptor {
    pub fn is_plain(&self) -> bool {
        *self == FormatDescriptor::default()
    }
}

/// Drawing size in EMU (English Metric Units).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub cx: i64,
    pub cy: i64,
}

impl Extent {
    pub fn from_cm(width: f64, height: f64) -> Self {
        Extent {
            cx: (width * EMU_PER_CM).round() as i64,
            cy: (height * EMU_PER_CM).round() as i64,
        }
    }

    pub fn from_pixels(width: f64, height: f64) -> Self {
        Extent {
            cx: (width * EMU_PER_PIXEL).round() as i64,
            cy: (height * EMU_PER_PIXEL).round() as i64,
        }
    }

    pub fn width_cm(&self) -> f64 {
        self.cx as f64 / EMU_PER_CM
    }

    pub fn height_cm(&self) -> f64 {
        self.cy as f64 / EMU_PER_CM
    }

    pub fn width_pixels(&self) -> f64 {
        self.cx as f64 / EMU_PER_PIXEL
    }

    pub fn height_pixels(&self) -> f64 {
        self.cy as f64 / EMU_PER_PIXEL
    }

    pub fn is_empty(&self) -> bool {
        self.cx <= 0 || self.cy <= 0
    }
}

/// A replacement picture read from disk, shared by every span that embeds it.
#[derive(Debug)]
pub struct ImageData {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub format: image::ImageFormat,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl ImageData {
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }

    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn natural_extent(&self) -> Extent {
        Extent::from_pixels(self.pixel_width as f64, self.pixel_height as f64)
    }
}

#[derive(Clone, Debug)]
pub enum ImageSource {
    /// Picture already stored in the package, addressed by relationship id.
    Embedded { rel_id: String },
    /// Picture supplied by the caller, embedded when the document is saved.
    Inserted(Arc<ImageData>),
}

impl PartialEq for ImageSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ImageSource::Embedded { rel_id: a }, ImageSource::Embedded { rel_id: b }) => a == b,
            (ImageSource::Inserted(a), ImageSource::Inserted(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Original drawing markup of a picture that came from a package. Ranges are
/// relative to `xml`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct NativeImage {
    pub(crate) xml: String,
    pub(crate) embed: Range<usize>,
    pub(crate) extents: Vec<(Range<usize>, Range<usize>)>,
    pub(crate) original: Extent,
    pub(crate) run_props: Option<String>,
    /// Range of the whole anchor inside its drawing part.
    pub(crate) origin: Option<Range<usize>>,
    /// End marker of a two-cell anchor, relative to `xml`.
    pub(crate) to_marker: Option<Range<usize>>,
    pub(crate) two_cell: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageSpan {
    pub source: ImageSource,
    pub extent: Extent,
    /// Drawing id inside the package; 0 until a writer assigns one.
    pub anchor_id: u32,
    pub(crate) native: Option<NativeImage>,
}

impl ImageSpan {
    pub fn new(source: ImageSource, extent: Extent) -> Self {
        ImageSpan {
            source,
            extent,
            anchor_id: 0,
            native: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub format: FormatDescriptor,
}

impl TextSpan {
    pub fn new(text: impl Into<String>, format: FormatDescriptor) -> Self {
        TextSpan {
            text: text.into(),
            format,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Span {
    Text(TextSpan),
    Image(ImageSpan),
}

impl Span {
    pub fn text(text: impl Into<String>, format: FormatDescriptor) -> Self {
        Span::Text(TextSpan::new(text, format))
    }

    pub fn as_text(&self) -> Option<&TextSpan> {
        match self {
            Span::Text(t) => Some(t),
            Span::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageSpan> {
        match self {
            Span::Image(i) => Some(i),
            Span::Text(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Paragraph,
    Cell,
}

/// Paragraph- or cell-level properties. They live outside the span list, so a
/// span rebuild never resets them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitProps {
    pub alignment: Option<Alignment>,
    pub style: Option<String>,
    pub(crate) native: Option<String>,
}

/// Content the consolidator cannot model without loss.
#[derive(Clone, Debug, PartialEq)]
pub struct Unsupported {
    pub reason: String,
    /// Visible text, used only to decide whether the unit mattered.
    pub text: String,
}

/// Where a unit's markup lives inside its package part.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Origin {
    pub(crate) part: usize,
    pub(crate) range: Range<usize>,
    pub(crate) open_tag: String,
    pub(crate) close_tag: String,
}

#[derive(Debug)]
pub struct CommitError {
    pub reason: String,
}

/// The smallest container a token or image can live in: a paragraph or a
/// spreadsheet cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    kind: UnitKind,
    spans: Vec<Span>,
    props: UnitProps,
    unsupported: Option<Unsupported>,
    rewritten: bool,
    pub(crate) origin: Option<Origin>,
}

impl Unit {
    pub fn paragraph(spans: Vec<Span>) -> Self {
        Unit::new(UnitKind::Paragraph, spans)
    }

    pub fn cell(spans: Vec<Span>) -> Self {
        Unit::new(UnitKind::Cell, spans)
    }

    fn new(kind: UnitKind, spans: Vec<Span>) -> Self {
        Unit {
            kind,
            spans,
            props: UnitProps::default(),
            unsupported: None,
            rewritten: false,
            origin: None,
        }
    }

    pub fn with_props(mut self, props: UnitProps) -> Self {
        self.props = props;
        self
    }

    /// A unit whose content is kept out of the engine's reach.
    pub fn unsupported(kind: UnitKind, reason: impl Into<String>, text: impl Into<String>) -> Self {
        let mut unit = Unit::new(kind, Vec::new());
        unit.unsupported = Some(Unsupported {
            reason: reason.into(),
            text: text.into(),
        });
        unit
    }

    pub(crate) fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Attaches a picture read from a drawing part that anchors to this unit.
    pub(crate) fn push_image(&mut self, image: ImageSpan) {
        self.spans.push(Span::Image(image));
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn props(&self) -> &UnitProps {
        &self.props
    }

    pub fn unsupported_content(&self) -> Option<&Unsupported> {
        self.unsupported.as_ref()
    }

    pub fn is_rewritten(&self) -> bool {
        self.rewritten
    }

    /// Concatenated text of all text spans.
    pub fn text(&self) -> String {
        self.spans
            .iter()
            .filter_map(Span::as_text)
            .map(|t| t.text.as_str())
            .collect()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageSpan> {
        self.spans.iter().filter_map(Span::as_image)
    }

    /// Swaps in a new span list after the backend rules for this kind of unit
    /// accepted it. On error the unit is left exactly as it was.
    pub(crate) fn replace_spans(&mut self, spans: Vec<Span>) -> Result<(), CommitError> {
        self.kind.validate(&spans)?;
        self.spans = spans;
        self.rewritten = true;
        Ok(())
    }
}

impl UnitKind {
    fn validate(self, spans: &[Span]) -> Result<(), CommitError> {
        let mut chars = 0usize;
        for span in spans {
            match span {
                Span::Text(t) => {
                    if let Some(bad) = t.text.chars().find(|&c| !is_xml_char(c)) {
                        return Err(CommitError {
                            reason: format!("text contains U+{:04X}, which XML cannot store", bad as u32),
                        });
                    }
                    chars += t.text.chars().count();
                }
                Span::Image(i) => {
                    if let ImageSource::Inserted(data) = &i.source
                        && data.bytes.is_empty()
                    {
                        return Err(CommitError {
                            reason: format!("image {} is empty", data.path.display()),
                        });
                    }
                    if i.extent.is_empty() {
                        return Err(CommitError {
                            reason: "image has no visible size".into(),
                        });
                    }
                }
            }
        }
        if self == UnitKind::Cell && chars > MAX_CELL_CHARS {
            return Err(CommitError {
                reason: format!("cell text is {chars} characters, the limit is {MAX_CELL_CHARS}"),
            });
        }
        Ok(())
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Paragraph(Unit),
    Table(Table),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub rows: Vec<TableRow>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableRow {
    pub cells: Vec<TableCell>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableCell {
    pub blocks: Vec<Block>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFooterVariant {
    Default,
    First,
    Even,
}

impl HeaderFooterVariant {
    pub const ALL: [HeaderFooterVariant; 3] = [
        HeaderFooterVariant::Default,
        HeaderFooterVariant::First,
        HeaderFooterVariant::Even,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderFooterVariant::Default => "default",
            HeaderFooterVariant::First => "first",
            HeaderFooterVariant::Even => "even",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderFooter {
    pub blocks: Vec<Block>,
}

/// Header and footer parts of one section, indexed by `HeaderFooterVariant`.
/// A variant the section does not define is `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Section {
    pub headers: [Option<HeaderFooter>; 3],
    pub footers: [Option<HeaderFooter>; 3],
}

/// Rich-text document: the body and every section's header/footer variants.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub body: Vec<Block>,
    pub sections: Vec<Section>,
}

impl Document {
    /// Every unit in the document, in no particular order.
    pub fn all_units(&self) -> Vec<&Unit> {
        let mut units = Vec::new();
        collect_units(&self.body, &mut units);
        for section in &self.sections {
            for part in section.headers.iter().chain(&section.footers).flatten() {
                collect_units(&part.blocks, &mut units);
            }
        }
        units
    }
}

fn collect_units<'a>(blocks: &'a [Block], out: &mut Vec<&'a Unit>) {
    for block in blocks {
        match block {
            Block::Paragraph(unit) => out.push(unit),
            Block::Table(table) => {
                for cell in table.rows.iter().flat_map(|r| &r.cells) {
                    collect_units(&cell.blocks, out);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub row: u32, // zero-based
    pub col: u32, // zero-based
    pub unit: Unit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// Populated cells in row-major order.
    pub cells: Vec<Cell>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, mut cells: Vec<Cell>) -> Self {
        cells.sort_by_key(|c| (c.row, c.col));
        Sheet {
            name: name.into(),
            cells,
        }
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.cells
            .binary_search_by_key(&(row, col), |c| (c.row, c.col))
            .ok()
            .map(|i| &self.cells[i])
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}
