use std::fmt;
use std::iter::Enumerate;
use std::vec;

use serde::Serialize;

use crate::model::{Block, Document, HeaderFooterVariant, Table, TableCell, Unit, Workbook};

/// Structural region a unit was found in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeKind {
    Body,
    Header {
        section: usize,
        variant: HeaderFooterVariant,
    },
    Footer {
        section: usize,
        variant: HeaderFooterVariant,
    },
    Sheet {
        index: usize,
        name: String,
    },
}

/// One level of table nesting: which table of the enclosing container, and
/// which cell of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TableCoord {
    pub table: usize,
    pub row: usize,
    pub col: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitPosition {
    /// Index among the paragraphs of the innermost container.
    Paragraph { index: usize },
    /// Zero-based spreadsheet coordinates.
    Cell { row: u32, col: u32 },
}

/// Stable, human-readable address of a unit, used to attribute failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScopePath {
    pub scope: ScopeKind,
    pub tables: Vec<TableCoord>,
    pub position: UnitPosition,
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ScopeKind::Body => write!(f, "body")?,
            ScopeKind::Header { section, variant } => {
                write!(f, "section[{section}]/header({})", variant.name())?
            }
            ScopeKind::Footer { section, variant } => {
                write!(f, "section[{section}]/footer({})", variant.name())?
            }
            ScopeKind::Sheet { index, name } => write!(f, "sheet[{index}]({name})")?,
        }
        for t in &self.tables {
            write!(f, "/table[{}]/cell[{},{}]", t.table, t.row, t.col)?;
        }
        match self.position {
            UnitPosition::Paragraph { index } => write!(f, "/p[{index}]"),
            UnitPosition::Cell { row, col } => write!(f, "!{}", cell_reference(row, col)),
        }
    }
}

/// "A1"-style reference for zero-based coordinates.
pub fn cell_reference(row: u32, col: u32) -> String {
    format!("{}{}", column_name(col), row + 1)
}

pub fn column_name(col: u32) -> String {
    let mut n = col + 1;
    let mut name = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        name.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

/// Parses "B3" into zero-based (row, col).
pub fn parse_cell_reference(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let mut col: u32 = 0;
    for b in letters.bytes() {
        col = col.checked_mul(26)?.checked_add((b.to_ascii_uppercase() - b'A') as u32 + 1)?;
    }
    let row: u32 = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

pub type Walk<'a> = Box<dyn Iterator<Item = (ScopePath, &'a mut Unit)> + 'a>;

/// A document model whose units can be enumerated in a fixed order.
///
/// Each call to `walk` starts a fresh traversal; every unit is yielded
/// exactly once.
pub trait ScopeWalker {
    fn walk(&mut self) -> Walk<'_>;
}

impl ScopeWalker for Document {
    fn walk(&mut self) -> Walk<'_> {
        Box::new(RichTextWalk::new(self))
    }
}

impl ScopeWalker for Workbook {
    fn walk(&mut self) -> Walk<'_> {
        Box::new(
            self.sheets
                .iter_mut()
                .enumerate()
                .flat_map(|(index, sheet)| {
                    let scope = ScopeKind::Sheet {
                        index,
                        name: sheet.name.clone(),
                    };
                    sheet.cells.iter_mut().map(move |cell| {
                        let path = ScopePath {
                            scope: scope.clone(),
                            tables: Vec::new(),
                            position: UnitPosition::Cell {
                                row: cell.row,
                                col: cell.col,
                            },
                        };
                        (path, &mut cell.unit)
                    })
                }),
        )
    }
}

#[derive(Clone)]
struct Prefix {
    scope: ScopeKind,
    tables: Vec<TableCoord>,
}

impl Prefix {
    fn at(&self, index: usize) -> ScopePath {
        ScopePath {
            scope: self.scope.clone(),
            tables: self.tables.clone(),
            position: UnitPosition::Paragraph { index },
        }
    }

    fn nested(&self, coord: TableCoord) -> Prefix {
        let mut tables = self.tables.clone();
        tables.push(coord);
        Prefix {
            scope: self.scope.clone(),
            tables,
        }
    }
}

enum Frame<'a> {
    /// A container's own paragraphs first, then its tables.
    Container {
        prefix: Prefix,
        units: Enumerate<vec::IntoIter<&'a mut Unit>>,
        tables: Enumerate<vec::IntoIter<&'a mut Table>>,
    },
    /// Cells of one table in row-major order.
    Table {
        prefix: Prefix,
        table: usize,
        cells: vec::IntoIter<(usize, usize, &'a mut TableCell)>,
    },
}

impl<'a> Frame<'a> {
    fn container(prefix: Prefix, blocks: &'a mut [Block]) -> Self {
        let mut units = Vec::new();
        let mut tables = Vec::new();
        for block in blocks {
            match block {
                Block::Paragraph(unit) => units.push(unit),
                Block::Table(table) => tables.push(table),
            }
        }
        Frame::Container {
            prefix,
            units: units.into_iter().enumerate(),
            tables: tables.into_iter().enumerate(),
        }
    }

    fn table(prefix: Prefix, index: usize, table: &'a mut Table) -> Self {
        let mut cells = Vec::new();
        for (r, row) in table.rows.iter_mut().enumerate() {
            for (c, cell) in row.cells.iter_mut().enumerate() {
                cells.push((r, c, cell));
            }
        }
        Frame::Table {
            prefix,
            table: index,
            cells: cells.into_iter(),
        }
    }
}

/// Depth-first walk: body, then per section the header variants followed by
/// the footer variants (default, first, even). Absent variants are skipped.
struct RichTextWalk<'a> {
    stack: Vec<Frame<'a>>,
}

impl<'a> RichTextWalk<'a> {
    fn new(doc: &'a mut Document) -> Self {
        let Document { body, sections } = doc;
        let mut roots = vec![Frame::container(
            Prefix {
                scope: ScopeKind::Body,
                tables: Vec::new(),
            },
            body,
        )];
        for (section, parts) in sections.iter_mut().enumerate() {
            for (variant, header) in HeaderFooterVariant::ALL.into_iter().zip(&mut parts.headers) {
                if let Some(header) = header {
                    let scope = ScopeKind::Header { section, variant };
                    roots.push(Frame::container(root_prefix(scope), &mut header.blocks));
                }
            }
            for (variant, footer) in HeaderFooterVariant::ALL.into_iter().zip(&mut parts.footers) {
                if let Some(footer) = footer {
                    let scope = ScopeKind::Footer { section, variant };
                    roots.push(Frame::container(root_prefix(scope), &mut footer.blocks));
                }
            }
        }
        roots.reverse();
        RichTextWalk { stack: roots }
    }
}

fn root_prefix(scope: ScopeKind) -> Prefix {
    Prefix {
        scope,
        tables: Vec::new(),
    }
}

impl<'a> Iterator for RichTextWalk<'a> {
    type Item = (ScopePath, &'a mut Unit);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_frame = match self.stack.last_mut()? {
                Frame::Container {
                    prefix,
                    units,
                    tables,
                } => {
                    if let Some((index, unit)) = units.next() {
                        return Some((prefix.at(index), unit));
                    }
                    tables
                        .next()
                        .map(|(index, table)| Frame::table(prefix.clone(), index, table))
                }
                Frame::Table {
                    prefix,
                    table,
                    cells,
                } => cells.next().map(|(row, col, cell)| {
                    let coord = TableCoord {
                        table: *table,
                        row,
                        col,
                    };
                    Frame::container(prefix.nested(coord), &mut cell.blocks)
                }),
            };
            match next_frame {
                Some(frame) => self.stack.push(frame),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Cell, FormatDescriptor, HeaderFooter, Section, Sheet, Span, TableRow,
    };

    fn para(text: &str) -> Block {
        Block::Paragraph(Unit::paragraph(vec![Span::text(text, FormatDescriptor::default())]))
    }

    fn table(cells: Vec<Vec<Vec<Block>>>) -> Block {
        Block::Table(Table {
            rows: cells
                .into_iter()
                .map(|row| TableRow {
                    cells: row.into_iter().map(|blocks| TableCell { blocks }).collect(),
                })
                .collect(),
        })
    }

    #[test]
    fn walks_body_then_tables_then_headers_and_footers() {
        let nested = table(vec![vec![vec![para("nested")]]]);
        let mut section = Section::default();
        section.footers[HeaderFooterVariant::Even.index()] = Some(HeaderFooter {
            blocks: vec![para("footer-even")],
        });
        section.headers[HeaderFooterVariant::Default.index()] = Some(HeaderFooter {
            blocks: vec![para("header-default")],
        });
        section.headers[HeaderFooterVariant::First.index()] = Some(HeaderFooter {
            blocks: vec![para("header-first")],
        });
        let mut doc = Document {
            body: vec![
                para("p0"),
                table(vec![
                    vec![vec![para("r0c0")], vec![para("r0c1"), nested]],
                    vec![vec![para("r1c0")]],
                ]),
                para("p1"),
            ],
            sections: vec![section],
        };

        let texts: Vec<String> = doc.walk().map(|(_, unit)| unit.text()).collect();
        assert_eq!(
            texts,
            vec![
                "p0",
                "p1",
                "r0c0",
                "r0c1",
                "nested",
                "r1c0",
                "header-default",
                "header-first",
                "footer-even"
            ]
        );

        // restartable
        assert_eq!(doc.walk().count(), 9);
    }

    #[test]
    fn paths_describe_nesting() {
        let mut doc = Document {
            body: vec![table(vec![vec![
                vec![para("a")],
                vec![table(vec![vec![vec![para("x"), para("y")]]])],
            ]])],
            sections: vec![],
        };
        let paths: Vec<String> = doc.walk().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "body/table[0]/cell[0,0]/p[0]",
                "body/table[0]/cell[0,1]/table[0]/cell[0,0]/p[0]",
                "body/table[0]/cell[0,1]/table[0]/cell[0,0]/p[1]",
            ]
        );
    }

    #[test]
    fn header_path_names_section_and_variant() {
        let mut section = Section::default();
        section.footers[HeaderFooterVariant::First.index()] = Some(HeaderFooter {
            blocks: vec![para("f")],
        });
        let mut doc = Document {
            body: vec![],
            sections: vec![Section::default(), section],
        };
        let paths: Vec<String> = doc.walk().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["section[1]/footer(first)/p[0]"]);
    }

    #[test]
    fn workbook_walk_is_sheet_then_row_major() {
        let cell = |row, col, text: &str| Cell {
            row,
            col,
            unit: Unit::cell(vec![Span::text(text, FormatDescriptor::default())]),
        };
        let mut wb = Workbook {
            sheets: vec![
                Sheet::new("First", vec![cell(1, 0, "A2"), cell(0, 1, "B1")]),
                Sheet::new("Second", vec![cell(0, 27, "AB1")]),
            ],
        };
        let seen: Vec<(String, String)> = wb
            .walk()
            .map(|(p, u)| (p.to_string(), u.text()))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("sheet[0](First)!B1".to_string(), "B1".to_string()),
                ("sheet[0](First)!A2".to_string(), "A2".to_string()),
                ("sheet[1](Second)!AB1".to_string(), "AB1".to_string()),
            ]
        );
    }

    #[test]
    fn cell_references_round_trip() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(701), "ZZ");
        assert_eq!(parse_cell_reference("AB12"), Some((11, 27)));
        assert_eq!(parse_cell_reference("A0"), None);
        assert_eq!(parse_cell_reference("12"), None);
    }
}
