use std::collections::HashSet;

use super::{WML_NS, WPD_NS, XmlPart, is_wml, wml, wml_attr};
use crate::error::Error;
use crate::model::{
    Alignment, Block, Document, Extent, FormatDescriptor, HeaderFooter, HeaderFooterVariant,
    ImageSource, ImageSpan, NativeImage, Origin, Section, Span, Table, TableCell, TableRow, Unit,
    UnitKind, UnitProps,
};
use crate::package::{Package, REL_FOOTER, REL_HEADER, Relationships};
use crate::xml::{DML_NS, R_NS, descendant, element_tags, source};

pub(super) struct Loaded {
    pub(super) document: Document,
    pub(super) parts: Vec<XmlPart>,
    pub(super) max_drawing_id: u32,
}

/// Paragraph content that is dropped on rewrite without changing what the
/// paragraph shows.
const IGNORABLE: &[&str] = &[
    "proofErr",
    "bookmarkStart",
    "bookmarkEnd",
    "permStart",
    "permEnd",
];

fn parse_hex_color(val: &str) -> Option<[u8; 3]> {
    if val == "auto" || val.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&val[0..2], 16).ok()?;
    let g = u8::from_str_radix(&val[2..4], 16).ok()?;
    let b = u8::from_str_radix(&val[4..6], 16).ok()?;
    Some([r, g, b])
}

fn parse_alignment(val: &str) -> Alignment {
    match val {
        "center" => Alignment::Center,
        "right" | "end" => Alignment::Right,
        "both" | "distribute" => Alignment::Justify,
        _ => Alignment::Left,
    }
}

/// `<w:b/>` is on, `<w:b w:val="0"/>` is off, no element inherits.
fn wml_bool(rpr: roxmltree::Node, name: &str) -> Option<bool> {
    wml(rpr, name).map(|n| {
        n.attribute((WML_NS, "val"))
            .is_none_or(|v| v != "0" && v != "false" && v != "off")
    })
}

/// Reader state for one XML part.
struct PartReader<'x> {
    index: usize,
    xml: &'x str,
    /// Generated runs use the `w:` prefix, so a part that binds the
    /// namespace to another prefix can be read but not rewritten.
    writable: bool,
    max_drawing_id: u32,
}

pub(super) fn load(package: &Package, main_part: &str) -> Result<Loaded, Error> {
    let xml = package
        .text(main_part)?
        .ok_or_else(|| Error::InvalidDocx(format!("missing {main_part}")))?;
    let rels = Relationships::load(package, main_part)?;

    let mut parts = vec![XmlPart {
        name: main_part.to_string(),
        xml: String::new(),
    }];
    let mut max_drawing_id = 0;
    let (body, section_refs) = {
        let doc = roxmltree::Document::parse(&xml)?;
        let body = wml(doc.root_element(), "body")
            .ok_or_else(|| Error::InvalidDocx("missing w:body".into()))?;
        let mut reader = PartReader::new(0, &xml, doc.root_element());
        let blocks = reader.blocks(body);
        max_drawing_id = max_drawing_id.max(reader.max_drawing_id);
        (blocks, section_references(body))
    };
    parts[0].xml = xml;

    let mut seen = HashSet::new();
    let mut sections = Vec::with_capacity(section_refs.len());
    for refs in section_refs {
        let mut section = Section::default();
        for (is_header, variant, rel_id) in refs {
            let (expected, kind) = if is_header {
                (REL_HEADER, "header")
            } else {
                (REL_FOOTER, "footer")
            };
            if rels.get(&rel_id).is_some_and(|r| r.rel_type != expected) {
                log::warn!("Section reference {rel_id} is not a {kind} relationship, skipping");
                continue;
            }
            let Some(part_name) = rels.target_part(&rel_id) else {
                log::warn!("Section reference {rel_id} has no target, skipping");
                continue;
            };
            if !seen.insert(part_name.clone()) {
                continue;
            }
            let Some(part_xml) = package.text(&part_name)? else {
                log::warn!("{part_name} is referenced but missing, skipping");
                continue;
            };
            let index = parts.len();
            let blocks = {
                let doc = roxmltree::Document::parse(&part_xml)?;
                let mut reader = PartReader::new(index, &part_xml, doc.root_element());
                let blocks = reader.blocks(doc.root_element());
                max_drawing_id = max_drawing_id.max(reader.max_drawing_id);
                blocks
            };
            parts.push(XmlPart {
                name: part_name,
                xml: part_xml,
            });
            let slot = if is_header {
                &mut section.headers
            } else {
                &mut section.footers
            };
            slot[variant.index()] = Some(HeaderFooter { blocks });
        }
        sections.push(section);
    }

    Ok(Loaded {
        document: Document { body, sections },
        parts,
        max_drawing_id,
    })
}

type SectionRefs = Vec<(bool, HeaderFooterVariant, String)>;

/// Header/footer references of every section, in document order: sections
/// end at a paragraph-level `w:sectPr`, the last one is the body's own.
fn section_references(body: roxmltree::Node) -> Vec<SectionRefs> {
    body.descendants()
        .filter(|n| is_wml(*n, "sectPr"))
        .filter(|n| n.parent().is_some_and(|p| is_wml(p, "pPr") || is_wml(p, "body")))
        .map(|sect| {
            sect.children()
                .filter_map(|r| {
                    let is_header = match r.tag_name().name() {
                        "headerReference" => true,
                        "footerReference" => false,
                        _ => return None,
                    };
                    if r.tag_name().namespace() != Some(WML_NS) {
                        return None;
                    }
                    let variant = match r.attribute((WML_NS, "type")) {
                        Some("first") => HeaderFooterVariant::First,
                        Some("even") => HeaderFooterVariant::Even,
                        _ => HeaderFooterVariant::Default,
                    };
                    let id = r.attribute((R_NS, "id"))?;
                    Some((is_header, variant, id.to_string()))
                })
                .collect()
        })
        .collect()
}

/// Children of `node`, looking through block-level content controls and
/// custom XML wrappers.
fn content_children<'a>(node: roxmltree::Node<'a, 'a>, out: &mut Vec<roxmltree::Node<'a, 'a>>) {
    for child in node.children().filter(|n| n.is_element()) {
        if is_wml(child, "sdt") {
            if let Some(content) = wml(child, "sdtContent") {
                content_children(content, out);
            }
        } else if is_wml(child, "customXml") {
            content_children(child, out);
        } else {
            out.push(child);
        }
    }
}

fn wml_children<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Vec<roxmltree::Node<'a, 'a>> {
    let mut all = Vec::new();
    content_children(node, &mut all);
    all.retain(|n| is_wml(*n, name));
    all
}

/// Visible text of a paragraph, for deciding whether an unsupported one
/// mattered.
fn visible_text(node: roxmltree::Node) -> String {
    node.descendants()
        .filter(|n| is_wml(*n, "t") || is_wml(*n, "instrText"))
        .filter_map(|n| n.text())
        .collect()
}

enum RunItem {
    Text(char),
    Str(String),
    Image(ImageSpan),
}

impl<'x> PartReader<'x> {
    fn new(index: usize, xml: &'x str, root: roxmltree::Node) -> Self {
        let writable = root.lookup_prefix(WML_NS) == Some("w");
        if !writable {
            log::warn!("WordprocessingML namespace is not bound to w: in part {index}, leaving it untouched");
        }
        PartReader {
            index,
            xml,
            writable,
            max_drawing_id: 0,
        }
    }

    fn blocks(&mut self, container: roxmltree::Node) -> Vec<Block> {
        let mut children = Vec::new();
        content_children(container, &mut children);
        let mut blocks = Vec::new();
        for node in children {
            if is_wml(node, "p") {
                blocks.push(Block::Paragraph(self.paragraph(node)));
            } else if is_wml(node, "tbl") {
                blocks.push(Block::Table(self.table(node)));
            }
        }
        blocks
    }

    fn table(&mut self, tbl: roxmltree::Node) -> Table {
        let rows = wml_children(tbl, "tr")
            .into_iter()
            .map(|tr| TableRow {
                cells: wml_children(tr, "tc")
                    .into_iter()
                    .map(|tc| TableCell {
                        blocks: self.blocks(tc),
                    })
                    .collect(),
            })
            .collect();
        Table { rows }
    }

    fn paragraph(&mut self, p: roxmltree::Node) -> Unit {
        let range = p.range();
        let origin = element_tags(self.xml, &range, &[]).map(|(open_tag, close_tag)| Origin {
            part: self.index,
            range,
            open_tag,
            close_tag,
        });
        // drawing ids count even when the paragraph is left alone
        for doc_pr in p.descendants().filter(|n| crate::xml::is(*n, WPD_NS, "docPr")) {
            if let Some(id) = doc_pr.attribute("id").and_then(|v| v.parse::<u32>().ok()) {
                self.max_drawing_id = self.max_drawing_id.max(id);
            }
        }

        let unit = match (self.writable, origin.is_some()) {
            (false, _) => Err("part uses a non-standard WordprocessingML prefix".to_string()),
            (true, false) => Err("paragraph markup could not be located".to_string()),
            (true, true) => self.paragraph_content(p),
        };
        let unit = match unit {
            Ok(unit) => unit,
            Err(reason) => Unit::unsupported(UnitKind::Paragraph, reason, visible_text(p)),
        };
        match origin {
            Some(origin) => unit.with_origin(origin),
            None => unit,
        }
    }

    fn paragraph_content(&mut self, p: roxmltree::Node) -> Result<Unit, String> {
        let mut props = UnitProps::default();
        let mut spans = Vec::new();
        for child in p.children().filter(|n| n.is_element()) {
            let name = child.tag_name().name();
            if child.tag_name().namespace() != Some(WML_NS) {
                return Err(format!("paragraph contains foreign element {name}"));
            }
            match name {
                "pPr" => {
                    props.alignment = wml_attr(child, "jc").map(parse_alignment);
                    props.style = wml_attr(child, "pStyle").map(str::to_string);
                    props.native = Some(source(self.xml, child).to_string());
                }
                "r" => self.run(child, &mut spans)?,
                n if IGNORABLE.contains(&n) => {}
                n => return Err(format!("paragraph contains w:{n}")),
            }
        }
        Ok(Unit::paragraph(spans).with_props(props))
    }

    fn run(&mut self, r: roxmltree::Node, spans: &mut Vec<Span>) -> Result<(), String> {
        let rpr = wml(r, "rPr");
        let format = rpr.map(|n| self.format(n)).unwrap_or_default();
        let run_props = rpr.map(|n| source(self.xml, n).to_string());

        let mut items = Vec::new();
        for child in r.children().filter(|n| n.is_element()) {
            let name = child.tag_name().name();
            if child.tag_name().namespace() != Some(WML_NS) {
                return Err(format!("run contains foreign element {name}"));
            }
            match name {
                "rPr" | "lastRenderedPageBreak" => {}
                "t" => items.push(RunItem::Str(child.text().unwrap_or("").to_string())),
                "tab" => items.push(RunItem::Text('\t')),
                "br" => match child.attribute((WML_NS, "type")) {
                    None | Some("textWrapping") => items.push(RunItem::Text('\n')),
                    Some(kind) => return Err(format!("run contains a {kind} break")),
                },
                "cr" => items.push(RunItem::Text('\n')),
                "softHyphen" => items.push(RunItem::Text('\u{AD}')),
                "noBreakHyphen" => items.push(RunItem::Text('\u{2011}')),
                "drawing" => items.push(RunItem::Image(self.drawing(child, run_props.clone())?)),
                n => return Err(format!("run contains w:{n}")),
            }
        }

        let mut text = String::new();
        for item in items {
            match item {
                RunItem::Text(c) => text.push(c),
                RunItem::Str(s) => text.push_str(&s),
                RunItem::Image(image) => {
                    if !text.is_empty() {
                        spans.push(Span::text(std::mem::take(&mut text), format.clone()));
                    }
                    spans.push(Span::Image(image));
                }
            }
        }
        if !text.is_empty() {
            spans.push(Span::text(text, format));
        }
        Ok(())
    }

    fn format(&self, rpr: roxmltree::Node) -> FormatDescriptor {
        let font_name = wml(rpr, "rFonts").and_then(|f| {
            f.attribute((WML_NS, "ascii"))
                .or_else(|| f.attribute((WML_NS, "hAnsi")))
                .map(str::to_string)
        });
        FormatDescriptor {
            font_name,
            font_size: wml_attr(rpr, "sz")
                .and_then(|v| v.parse::<f32>().ok())
                .map(|half_points| half_points / 2.0),
            bold: wml_bool(rpr, "b"),
            italic: wml_bool(rpr, "i"),
            underline: wml(rpr, "u").map(|u| u.attribute((WML_NS, "val")) != Some("none")),
            color: wml_attr(rpr, "color").and_then(parse_hex_color),
            native: Some(source(self.xml, rpr).to_string()),
        }
    }

    /// A picture drawing; charts, shapes and text boxes are not modelled.
    fn drawing(&mut self, drawing: roxmltree::Node, run_props: Option<String>) -> Result<ImageSpan, String> {
        let container = drawing
            .children()
            .find(|n| crate::xml::is(*n, WPD_NS, "inline") || crate::xml::is(*n, WPD_NS, "anchor"))
            .ok_or("drawing has no inline or anchor placement")?;
        if container.descendants().any(|n| n.tag_name().name() == "txbx") {
            return Err("drawing contains a text box".into());
        }
        let blip = descendant(container, DML_NS, "blip")
            .ok_or("drawing is not a picture")?;
        let embed = blip
            .attribute_node((R_NS, "embed"))
            .ok_or("picture is linked, not embedded")?;

        let base = drawing.range().start;
        let rel = |range: std::ops::Range<usize>| range.start - base..range.end - base;

        let mut extents = Vec::new();
        let mut original = Extent::default();
        let wp_extent = crate::xml::child(container, WPD_NS, "extent");
        let a_ext = descendant(container, crate::xml::PIC_NS, "spPr")
            .and_then(|sp| crate::xml::child(sp, DML_NS, "xfrm"))
            .and_then(|x| crate::xml::child(x, DML_NS, "ext"));
        for node in [wp_extent, a_ext].into_iter().flatten() {
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

        let anchor_id = crate::xml::child(container, WPD_NS, "docPr")
            .and_then(|d| d.attribute("id"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(ImageSpan {
            source: ImageSource::Embedded {
                rel_id: embed.value().to_string(),
            },
            extent: original,
            anchor_id,
            native: Some(NativeImage {
                xml: source(self.xml, drawing).to_string(),
                embed: rel(embed.range_value()),
                extents,
                original,
                run_props,
                origin: None,
                to_marker: None,
                two_cell: false,
            }),
        })
    }
}
