use std::collections::BTreeMap;

use super::{DrawingPart, SML_NS, SheetPart, XDR_NS, root_prefix};
use crate::error::Error;
use crate::model::{
    Cell, Extent, FormatDescriptor, ImageSource, ImageSpan, NativeImage, Origin, Sheet, Span,
    Unit, UnitKind, Workbook,
};
use crate::package::{Package, REL_DRAWING, REL_SHARED_STRINGS, REL_WORKSHEET, Relationships};
use crate::scope::parse_cell_reference;
use crate::xml::{DML_NS, R_NS, child, descendant, element_tags, is, source};

pub(super) struct Loaded {
    pub(super) workbook: Workbook,
    pub(super) sheets: Vec<SheetPart>,
}

fn sml<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<roxmltree::Node<'a, 'a>> {
    child(node, SML_NS, name)
}

fn sml_children<'a>(
    node: roxmltree::Node<'a, 'a>,
    name: &'static str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'a>> {
    node.children().filter(move |n| is(*n, SML_NS, name))
}

/// `FFRRGGBB` or `RRGGBB`.
fn parse_argb(val: &str) -> Option<[u8; 3]> {
    let hex = match val.len() {
        8 => &val[2..],
        6 => val,
        _ => return None,
    };
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r, g, b])
}

fn sml_bool(rpr: roxmltree::Node, name: &str) -> Option<bool> {
    sml(rpr, name).map(|n| n.attribute("val").is_none_or(|v| v != "0" && v != "false"))
}

/// Rich-text content of a shared (`si`) or inline (`is`) string.
fn rich_text(xml: &str, node: roxmltree::Node, keep_native: bool) -> Vec<Span> {
    let mut spans = Vec::new();
    for item in node.children().filter(|n| n.is_element() && n.tag_name().namespace() == Some(SML_NS)) {
        match item.tag_name().name() {
            "t" => {
                let text = item.text().unwrap_or("");
                if !text.is_empty() {
                    spans.push(Span::text(text, FormatDescriptor::default()));
                }
            }
            "r" => {
                let text: String = sml_children(item, "t").filter_map(|t| t.text()).collect();
                if text.is_empty() {
                    continue;
                }
                let format = sml(item, "rPr")
                    .map(|rpr| run_format(xml, rpr, keep_native))
                    .unwrap_or_default();
                spans.push(Span::text(text, format));
            }
            _ => {}
        }
    }
    spans
}

fn run_format(xml: &str, rpr: roxmltree::Node, keep_native: bool) -> FormatDescriptor {
    FormatDescriptor {
        font_name: sml(rpr, "rFont")
            .and_then(|n| n.attribute("val"))
            .map(str::to_string),
        font_size: sml(rpr, "sz")
            .and_then(|n| n.attribute("val"))
            .and_then(|v| v.parse().ok()),
        bold: sml_bool(rpr, "b"),
        italic: sml_bool(rpr, "i"),
        underline: sml(rpr, "u").map(|u| u.attribute("val") != Some("none")),
        color: sml(rpr, "color")
            .and_then(|n| n.attribute("rgb"))
            .and_then(parse_argb),
        native: keep_native.then(|| source(xml, rpr).to_string()),
    }
}

fn shared_strings(package: &Package, part: Option<String>) -> Result<Vec<Vec<Span>>, Error> {
    let Some(part) = part else {
        return Ok(Vec::new());
    };
    let Some(xml) = package.text(&part)? else {
        log::warn!("{part} is referenced but missing");
        return Ok(Vec::new());
    };
    let doc = roxmltree::Document::parse(&xml)?;
    let root = doc.root_element();
    // rPr markup is copied into sheets, which use the default namespace
    let keep_native = root_prefix(&xml, root).is_empty();
    Ok(sml_children(root, "si")
        .map(|si| rich_text(&xml, si, keep_native))
        .collect())
}

pub(super) fn load(package: &Package, workbook_part: &str) -> Result<Loaded, Error> {
    let xml = package
        .text(workbook_part)?
        .ok_or_else(|| Error::InvalidXlsx(format!("missing {workbook_part}")))?;
    let rels = Relationships::load(package, workbook_part)?;
    let shared = shared_strings(
        package,
        rels.first_of_type(REL_SHARED_STRINGS)
            .and_then(|r| rels.target_part(&r.id)),
    )?;

    let doc = roxmltree::Document::parse(&xml)?;
    let sheets_node = sml(doc.root_element(), "sheets")
        .ok_or_else(|| Error::InvalidXlsx("workbook has no sheets".into()))?;

    let mut sheets = Vec::new();
    let mut parts = Vec::new();
    for sheet in sml_children(sheets_node, "sheet") {
        let name = sheet.attribute("name").unwrap_or_default().to_string();
        let rel = sheet.attribute((R_NS, "id")).and_then(|id| rels.get(id));
        if let Some(rel) = rel.filter(|r| r.rel_type != REL_WORKSHEET) {
            log::warn!("Sheet {name:?} is not a worksheet ({}), skipping", rel.rel_type);
            continue;
        }
        let Some(part_name) = rel.and_then(|r| rels.target_part(&r.id)) else {
            return Err(Error::InvalidXlsx(format!("sheet {name:?} has no part")));
        };
        let sheet_xml = package
            .text(&part_name)?
            .ok_or_else(|| Error::InvalidXlsx(format!("missing {part_name}")))?;
        let index = parts.len();
        let (cells, drawing) = read_sheet(package, index, &part_name, &sheet_xml, &shared)?;
        log::debug!("Sheet {name:?} ({part_name}): {} cells", cells.len());
        sheets.push(Sheet::new(name, cells));
        parts.push(SheetPart {
            name: part_name,
            xml: sheet_xml,
            drawing,
        });
    }

    Ok(Loaded {
        workbook: Workbook { sheets },
        sheets: parts,
    })
}

fn read_sheet(
    package: &Package,
    index: usize,
    part_name: &str,
    xml: &str,
    shared: &[Vec<Span>],
) -> Result<(Vec<Cell>, Option<DrawingPart>), Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();
    let writable = root_prefix(xml, root).is_empty();
    if !writable {
        log::warn!("{part_name} uses a prefixed SpreadsheetML namespace, leaving it untouched");
    }

    let mut cells: BTreeMap<(u32, u32), Cell> = BTreeMap::new();
    if let Some(data) = sml(root, "sheetData") {
        let mut row_index = 0u32;
        for row in sml_children(data, "row") {
            row_index = row
                .attribute("r")
                .and_then(|r| r.parse::<u32>().ok())
                .map_or(row_index + 1, |r| r);
            let mut col_index = 0u32;
            for c in sml_children(row, "c") {
                let (r, col) = c
                    .attribute("r")
                    .and_then(parse_cell_reference)
                    .unwrap_or((row_index.saturating_sub(1), col_index));
                col_index = col + 1;
                let Some(spans) = cell_text(xml, c, shared) else {
                    continue;
                };
                let unit = if writable {
                    let t_attr: Vec<_> = c
                        .attributes()
                        .filter(|a| a.name() == "t" && a.namespace().is_none())
                        .map(|a| a.range())
                        .collect();
                    let range = c.range();
                    match element_tags(xml, &range, &t_attr) {
                        Some((open_tag, close_tag)) => Unit::cell(spans).with_origin(Origin {
                            part: index,
                            range,
                            open_tag,
                            close_tag,
                        }),
                        None => Unit::unsupported(
                            UnitKind::Cell,
                            "cell markup could not be located",
                            visible_text(&spans),
                        ),
                    }
                } else {
                    Unit::unsupported(UnitKind::Cell, "sheet uses a prefixed namespace", visible_text(&spans))
                };
                cells.insert((r, col), Cell { row: r, col, unit });
            }
        }
    }

    let drawing = match sml(root, "drawing").and_then(|d| d.attribute((R_NS, "id"))) {
        Some(rel_id) if writable => {
            let rels = Relationships::load(package, part_name)?;
            match rels.target_part(rel_id) {
                Some(drawing_part) if rels.get(rel_id).is_some_and(|r| r.rel_type == REL_DRAWING) => {
                    read_drawing(package, &drawing_part, &mut cells)?
                }
                _ => None,
            }
        }
        _ => None,
    };

    Ok((cells.into_values().collect(), drawing))
}

/// Spans of a text-bearing cell; `None` for numbers, booleans, errors and
/// formulas.
fn cell_text(xml: &str, c: roxmltree::Node, shared: &[Vec<Span>]) -> Option<Vec<Span>> {
    if sml(c, "f").is_some() {
        return None;
    }
    match c.attribute("t") {
        Some("s") => {
            let index: usize = sml(c, "v")?.text()?.trim().parse().ok()?;
            let spans = shared.get(index);
            if spans.is_none() {
                log::warn!("Shared string {index} does not exist");
            }
            spans.cloned()
        }
        Some("inlineStr") => Some(sml(c, "is").map(|inline| rich_text(xml, inline, true)).unwrap_or_default()),
        _ => None,
    }
}

fn visible_text(spans: &[Span]) -> String {
    spans.iter().filter_map(Span::as_text).map(|t| t.text.as_str()).collect()
}

fn attr_u32(node: Option<roxmltree::Node>) -> Option<u32> {
    node?.text()?.trim().parse().ok()
}

/// Reads picture anchors and attaches them to their cells.
fn read_drawing(
    package: &Package,
    part: &str,
    cells: &mut BTreeMap<(u32, u32), Cell>,
) -> Result<Option<DrawingPart>, Error> {
    let Some(xml) = package.text(part)? else {
        log::warn!("{part} is referenced but missing");
        return Ok(None);
    };
    let mut max_id = 0;
    let prefix;
    {
        let doc = roxmltree::Document::parse(&xml)?;
        let root = doc.root_element();
        prefix = root_prefix(&xml, root);
        for id in root
            .descendants()
            .filter(|n| is(*n, XDR_NS, "cNvPr"))
            .filter_map(|n| n.attribute("id")?.parse::<u32>().ok())
        {
            max_id = max_id.max(id);
        }
        for anchor in root.children() {
            let two_cell = is(anchor, XDR_NS, "twoCellAnchor");
            if !two_cell && !is(anchor, XDR_NS, "oneCellAnchor") {
                continue;
            }
            let Some((row, col, image)) = read_anchor(&xml, anchor, two_cell) else {
                continue;
            };
            cells
                .entry((row, col))
                .or_insert_with(|| Cell {
                    row,
                    col,
                    unit: Unit::cell(Vec::new()),
                })
                .unit
                .push_image(image);
        }
    }
    Ok(Some(DrawingPart {
        name: part.to_string(),
        xml,
        prefix,
        max_id,
    }))
}

fn read_anchor(xml: &str, anchor: roxmltree::Node, two_cell: bool) -> Option<(u32, u32, ImageSpan)> {
    let from = child(anchor, XDR_NS, "from")?;
    let col = attr_u32(child(from, XDR_NS, "col"))?;
    let row = attr_u32(child(from, XDR_NS, "row"))?;
    let pic = child(anchor, XDR_NS, "pic")?;
    let embed = descendant(pic, DML_NS, "blip")?.attribute_node((R_NS, "embed"))?;

    let base = anchor.range().start;
    let rel = |range: std::ops::Range<usize>| range.start - base..range.end - base;

    let a_ext = child(pic, XDR_NS, "spPr")
        .and_then(|sp| child(sp, DML_NS, "xfrm"))
        .and_then(|x| child(x, DML_NS, "ext"));
    let xdr_ext = if two_cell { None } else { child(anchor, XDR_NS, "ext") };
    let mut extents = Vec::new();
    let mut original = Extent::default();
    for node in [xdr_ext, a_ext].into_iter().flatten() {
        let (Some(cx), Some(cy)) = (node.attribute_node("cx"), node.attribute_node("cy")) else {
            continue;
        };
        if original.is_empty() {
            original = Extent {
                cx: cx.value().parse().unwrap_or(0),
                cy: cy.value().parse().unwrap_or(0),
            };
        }
        extents.push((rel(cx.range_value()), rel(cy.range_value())));
    }

    let anchor_id = descendant(pic, XDR_NS, "cNvPr")
        .and_then(|n| n.attribute("id"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let to_marker = if two_cell {
        Some(rel(child(anchor, XDR_NS, "to")?.range()))
    } else {
        None
    };

    Some((
        row,
        col,
        ImageSpan {
            source: ImageSource::Embedded {
                rel_id: embed.value().to_string(),
            },
            extent: original,
            anchor_id,
            native: Some(NativeImage {
                xml: source(xml, anchor).to_string(),
                embed: rel(embed.range_value()),
                extents,
                original,
                run_props: None,
                origin: Some(anchor.range()),
                to_marker,
                two_cell,
            }),
        },
    ))
}
