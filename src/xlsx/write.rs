use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use quick_xml::escape::{escape, partial_escape};

use super::{DrawingPart, SheetPart, XDR_NS, XlsxFile};
use crate::error::Error;
use crate::model::{Extent, FormatDescriptor, ImageData, ImageSource, ImageSpan, NativeImage, Origin, Span};
use crate::package::{CT_DRAWING, ContentTypes, Package, REL_DRAWING, REL_IMAGE, Relationships};
use crate::xml::{DML_NS, R_NS, splice, start_tag_end};

/// Worksheet children that must follow `<drawing>`.
const AFTER_DRAWING: &[&str] = &[
    "legacyDrawing",
    "legacyDrawingHF",
    "drawingHF",
    "picture",
    "oleObjects",
    "controls",
    "webPublishItems",
    "tableParts",
    "extLst",
];

pub(super) fn write_back(file: &XlsxFile, package: &mut Package) -> Result<(), Error> {
    let mut content_types = ContentTypes::load(package)?;
    for (sheet, part) in file.workbook.sheets.iter().zip(&file.sheets) {
        let cells: Vec<_> = sheet.cells.iter().filter(|c| c.unit.is_rewritten()).collect();
        if cells.is_empty() {
            continue;
        }
        let mut sheet_edits = Vec::new();
        let mut drawing = SheetDrawing::new(part);
        for cell in &cells {
            if let Some(origin) = &cell.unit.origin {
                sheet_edits.push((origin.range.clone(), cell_xml(origin, cell.unit.spans())));
            }
            for image in cell.unit.images() {
                drawing.place(package, &mut content_types, cell.row, cell.col, image)?;
            }
        }
        if let Some(insert) = drawing.finish(package, &mut content_types)? {
            sheet_edits.push(insert);
        }
        if sheet_edits.is_empty() {
            continue;
        }
        log::debug!("Rewriting {} cells in {} ({})", cells.len(), sheet.name, part.name);
        let xml = splice(&part.xml, sheet_edits);
        package.put(&part.name, xml.into_bytes());
    }
    content_types.store(package)
}

/// A rewritten cell always holds an inline string; its shared-string entry
/// stays in the table unreferenced.
fn cell_xml(origin: &Origin, spans: &[Span]) -> String {
    let texts: Vec<_> = spans
        .iter()
        .filter_map(Span::as_text)
        .filter(|t| !t.text.is_empty())
        .collect();
    let mut xml = String::new();
    if texts.is_empty() {
        xml.push_str(&origin.open_tag);
        xml.push_str(&origin.close_tag);
        return xml;
    }
    let open = origin.open_tag.trim_end_matches('>');
    xml.push_str(open);
    xml.push_str(" t=\"inlineStr\"><is>");
    match texts.as_slice() {
        [only] if only.format.is_plain() => push_t(&mut xml, &only.text),
        _ => {
            for span in &texts {
                xml.push_str("<r>");
                match &span.format.native {
                    Some(rpr) => xml.push_str(rpr),
                    None => push_run_props(&mut xml, &span.format),
                }
                push_t(&mut xml, &span.text);
                xml.push_str("</r>");
            }
        }
    }
    xml.push_str("</is>");
    xml.push_str(&origin.close_tag);
    xml
}

fn push_t(xml: &mut String, text: &str) {
    xml.push_str("<t xml:space=\"preserve\">");
    xml.push_str(&partial_escape(text));
    xml.push_str("</t>");
}

fn push_run_props(xml: &mut String, format: &FormatDescriptor) {
    if format.is_plain() {
        return;
    }
    xml.push_str("<rPr>");
    if let Some(font) = &format.font_name {
        xml.push_str(&format!("<rFont val=\"{}\"/>", escape(font.as_str())));
    }
    if format.bold == Some(true) {
        xml.push_str("<b/>");
    }
    if format.italic == Some(true) {
        xml.push_str("<i/>");
    }
    if let Some([r, g, b]) = format.color {
        xml.push_str(&format!("<color rgb=\"FF{r:02X}{g:02X}{b:02X}\"/>"));
    }
    if let Some(size) = format.font_size {
        xml.push_str(&format!("<sz val=\"{size}\"/>"));
    }
    if format.underline == Some(true) {
        xml.push_str("<u/>");
    }
    xml.push_str("</rPr>");
}

/// Pending changes to one sheet's drawing part.
struct SheetDrawing<'a> {
    sheet: &'a SheetPart,
    part: Option<DrawingPart>,
    created: bool,
    rels: Option<Relationships>,
    embedded: HashMap<*const ImageData, String>,
    edits: Vec<(Range<usize>, String)>,
    appended: String,
    next_id: u32,
}

impl<'a> SheetDrawing<'a> {
    fn new(sheet: &'a SheetPart) -> Self {
        SheetDrawing {
            sheet,
            next_id: sheet.drawing.as_ref().map_or(0, |d| d.max_id) + 1,
            part: sheet.drawing.clone(),
            created: false,
            rels: None,
            embedded: HashMap::new(),
            edits: Vec::new(),
            appended: String::new(),
        }
    }

    fn place(
        &mut self,
        package: &mut Package,
        content_types: &mut ContentTypes,
        row: u32,
        col: u32,
        image: &ImageSpan,
    ) -> Result<(), Error> {
        match &image.native {
            Some(native) => {
                let Some(origin) = native.origin.clone() else {
                    return Ok(());
                };
                if matches!(image.source, ImageSource::Embedded { .. }) && image.extent == native.original {
                    return Ok(());
                }
                let rel_id = self.rel_id(package, content_types, image)?;
                self.edits.push((origin, patch_anchor(native, &rel_id, image.extent)));
            }
            None => {
                self.ensure_part(package);
                let rel_id = self.rel_id(package, content_types, image)?;
                let id = self.next_id;
                self.next_id += 1;
                let prefix = self.part.as_ref().map_or("xdr:", |p| p.prefix.as_str());
                let anchor = new_anchor(prefix, row, col, id, &rel_id, image);
                self.appended.push_str(&anchor);
            }
        }
        Ok(())
    }

    fn ensure_part(&mut self, package: &mut Package) {
        if self.part.is_some() {
            return;
        }
        let name = package.unique_part_name("xl/drawings/drawing", "xml");
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\r\n<xdr:wsDr xmlns:xdr=\"{XDR_NS}\" xmlns:a=\"{DML_NS}\"></xdr:wsDr>"
        );
        // reserve the name so another sheet does not pick it
        package.put(&name, xml.clone().into_bytes());
        log::debug!("Created {name} for {}", self.sheet.name);
        self.part = Some(DrawingPart {
            name,
            xml,
            prefix: "xdr:".into(),
            max_id: 0,
        });
        self.created = true;
    }

    fn rel_id(
        &mut self,
        package: &mut Package,
        content_types: &mut ContentTypes,
        image: &ImageSpan,
    ) -> Result<String, Error> {
        let data: &Arc<ImageData> = match &image.source {
            ImageSource::Embedded { rel_id } => return Ok(rel_id.clone()),
            ImageSource::Inserted(data) => data,
        };
        if let Some(id) = self.embedded.get(&Arc::as_ptr(data)) {
            return Ok(id.clone());
        }
        let Some(part) = &self.part else {
            return Err(Error::InvalidXlsx(format!("{} has no drawing part", self.sheet.name)));
        };
        let ext = data.extension();
        let media_part = package.unique_part_name("xl/media/merge_image", ext);
        package.put(&media_part, data.bytes.clone());
        content_types.ensure_default(ext, data.content_type());
        let mut rels = match self.rels.take() {
            Some(rels) => rels,
            None => Relationships::load(package, &part.name)?,
        };
        let id = rels.add(REL_IMAGE, &media_part);
        self.rels = Some(rels);
        log::debug!("Embedded {} as {media_part} ({id})", data.path.display());
        self.embedded.insert(Arc::as_ptr(data), id.clone());
        Ok(id)
    }

    /// Stores the drawing part and returns the `<drawing>` element to splice
    /// into the sheet when the part is new.
    fn finish(
        self,
        package: &mut Package,
        content_types: &mut ContentTypes,
    ) -> Result<Option<(Range<usize>, String)>, Error> {
        let Some(part) = self.part else {
            return Ok(None);
        };
        if self.edits.is_empty() && self.appended.is_empty() {
            return Ok(None);
        }
        let mut edits = self.edits;
        if !self.appended.is_empty() {
            let close = part
                .xml
                .rfind("</")
                .ok_or_else(|| Error::InvalidXlsx(format!("{} has no root end tag", part.name)))?;
            edits.push((close..close, self.appended));
        }
        package.put(&part.name, splice(&part.xml, edits).into_bytes());
        if let Some(rels) = &self.rels {
            rels.store(package);
        }
        if !self.created {
            return Ok(None);
        }

        content_types.ensure_override(&part.name, CT_DRAWING);
        let mut sheet_rels = Relationships::load(package, &self.sheet.name)?;
        let id = sheet_rels.add(REL_DRAWING, &part.name);
        sheet_rels.store(package);
        let at = drawing_position(&self.sheet.xml)?;
        Ok(Some((at..at, format!("<drawing xmlns:r=\"{R_NS}\" r:id=\"{id}\"/>"))))
    }
}

fn drawing_position(xml: &str) -> Result<usize, Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();
    let follower = root
        .children()
        .find(|n| n.is_element() && AFTER_DRAWING.contains(&n.tag_name().name()));
    match follower {
        Some(node) => Ok(node.range().start),
        None => xml
            .rfind("</")
            .ok_or_else(|| Error::InvalidXlsx("worksheet has no root end tag".into())),
    }
}

/// Points an existing anchor at `rel_id` with the new size. A resized
/// two-cell anchor becomes a one-cell anchor so the picture keeps its size
/// instead of stretching to the old cell range.
fn patch_anchor(native: &NativeImage, rel_id: &str, extent: Extent) -> String {
    let mut edits = vec![(native.embed.clone(), rel_id.to_string())];
    for (cx, cy) in &native.extents {
        edits.push((cx.clone(), extent.cx.to_string()));
        edits.push((cy.clone(), extent.cy.to_string()));
    }
    if native.two_cell
        && extent != native.original
        && let (Some(to), Some(tag_end), Some(close)) = (
            native.to_marker.clone(),
            start_tag_end(&native.xml, 0),
            native.xml.rfind("</"),
        )
    {
        let open = &native.xml[..tag_end];
        let name_end = open[1..]
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .map_or(1, |i| i + 1);
        let prefix = open[1..name_end].strip_suffix("twoCellAnchor").unwrap_or("");
        let rest = without_attribute(&open[name_end..], "editAs");
        edits.push((0..tag_end, format!("<{prefix}oneCellAnchor{rest}")));
        edits.push((
            to,
            format!("<{prefix}ext cx=\"{}\" cy=\"{}\"/>", extent.cx, extent.cy),
        ));
        edits.push((close..native.xml.len(), format!("</{prefix}oneCellAnchor>")));
    }
    splice(&native.xml, edits)
}

fn without_attribute(tag_rest: &str, name: &str) -> String {
    let needle = format!(" {name}=");
    let Some(start) = tag_rest.find(&needle) else {
        return tag_rest.to_string();
    };
    let value = start + needle.len();
    let end = tag_rest[value..]
        .chars()
        .next()
        .and_then(|quote| tag_rest[value + 1..].find(quote))
        .map_or(tag_rest.len(), |i| value + 1 + i + 1);
    format!("{}{}", &tag_rest[..start], &tag_rest[end..])
}

fn new_anchor(p: &str, row: u32, col: u32, id: u32, rel_id: &str, image: &ImageSpan) -> String {
    let (cx, cy) = (image.extent.cx, image.extent.cy);
    let name = match &image.source {
        ImageSource::Inserted(data) => data
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        ImageSource::Embedded { .. } => format!("Picture {id}"),
    };
    let name = escape(name.as_str());
    format!(
        concat!(
            r#"<{p}oneCellAnchor xmlns:a="{a}" xmlns:r="{r}">"#,
            r#"<{p}from><{p}col>{col}</{p}col><{p}colOff>0</{p}colOff><{p}row>{row}</{p}row><{p}rowOff>0</{p}rowOff></{p}from>"#,
            r#"<{p}ext cx="{cx}" cy="{cy}"/>"#,
            r#"<{p}pic><{p}nvPicPr><{p}cNvPr id="{id}" name="{name}"/><{p}cNvPicPr><a:picLocks noChangeAspect="1"/></{p}cNvPicPr></{p}nvPicPr>"#,
            r#"<{p}blipFill><a:blip r:embed="{rel_id}"/><a:stretch><a:fillRect/></a:stretch></{p}blipFill>"#,
            r#"<{p}spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></{p}spPr>"#,
            r#"</{p}pic><{p}clientData/></{p}oneCellAnchor>"#,
        ),
        p = p,
        a = DML_NS,
        r = R_NS,
        row = row,
        col = col,
        cx = cx,
        cy = cy,
        id = id,
        name = name,
        rel_id = rel_id,
    )
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::engine::apply_text_and_image_replacements;
    use crate::images::{ImagePlaceholder, ImagePlaceholderMap, SizePolicy};
    use crate::resolve::TokenMap;
    use crate::xlsx::tests::{sheet, write_xlsx};

    fn png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::new(w, h).save(&path).unwrap();
        path
    }

    #[test]
    fn rewritten_cells_become_inline_strings() {
        let dir = tempfile::tempdir().unwrap();
        let sheet1 = sheet(
            r#"<row r="1"><c r="A1" s="4" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1"><v>7</v></c></row>"#,
            "",
        );
        let path = write_xlsx(
            dir.path(),
            r#"<si><r><rPr><b/></rPr><t>Name: </t></r><r><t>{{NAME}}</t></r></si><si><t>static</t></si>"#,
            &sheet1,
            &sheet(r#"<row r="1"><c r="A1" t="inlineStr"><is><t>{{NAME}} &amp; co</t></is></c></row>"#, ""),
            &[],
        );
        let mut file = XlsxFile::open(&path).unwrap();
        let tokens = TokenMap::from_literals([("{{NAME}}", "<Ada>")]).unwrap();
        let report =
            apply_text_and_image_replacements(&mut file.workbook, &tokens, &ImagePlaceholderMap::default());
        assert_eq!(report.units_rewritten, 2);

        let out = dir.path().join("out.xlsx");
        file.save(&out).unwrap();
        let package = Package::open(&out).unwrap();
        let xml = package.text("xl/worksheets/sheet1.xml").unwrap().unwrap();
        assert!(xml.contains(
            r#"<c r="A1" s="4" t="inlineStr"><is><r><rPr><b/></rPr><t xml:space="preserve">Name: </t></r><r><t xml:space="preserve">&lt;Ada&gt;</t></r></is></c>"#
        ));
        assert!(xml.contains(r#"<c r="B1" t="s"><v>1</v></c><c r="C1"><v>7</v></c>"#));
        let xml2 = package.text("xl/worksheets/sheet2.xml").unwrap().unwrap();
        assert!(xml2.contains(
            r#"<c r="A1" t="inlineStr"><is><t xml:space="preserve">&lt;Ada&gt; &amp; co</t></is></c>"#
        ));
    }

    #[test]
    fn marker_creates_drawing_part() {
        let dir = tempfile::tempdir().unwrap();
        let logo = png(dir.path(), "logo.png", 100, 50);
        let sheet1 = sheet(
            r#"<row r="3"><c r="B3" t="s"><v>0</v></c></row>"#,
            r#"<pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/>"#,
        );
        let path = write_xlsx(dir.path(), "<si><t>{{LOGO}}</t></si>", &sheet1, &sheet("", ""), &[]);
        let mut file = XlsxFile::open(&path).unwrap();
        let images = ImagePlaceholderMap::new(vec![ImagePlaceholder::new(
            "{{LOGO}}",
            &logo,
            SizePolicy::Fixed(Extent::from_cm(3.5, 1.5)),
        )])
        .unwrap();
        let report = apply_text_and_image_replacements(&mut file.workbook, &TokenMap::empty(), &images);
        assert_eq!(report.images_replaced, 1);

        let out = dir.path().join("out.xlsx");
        file.save(&out).unwrap();
        let package = Package::open(&out).unwrap();
        let xml = package.text("xl/worksheets/sheet1.xml").unwrap().unwrap();
        assert!(xml.contains(r#"<c r="B3"></c>"#));
        assert!(xml.contains(r#"footer="0.3"/><drawing xmlns:r="#));
        let rels = Relationships::load(&package, "xl/worksheets/sheet1.xml").unwrap();
        assert_eq!(rels.target_part("rId1").as_deref(), Some("xl/drawings/drawing1.xml"));

        let drawing = package.text("xl/drawings/drawing1.xml").unwrap().unwrap();
        assert!(drawing.contains("<xdr:col>1</xdr:col>"));
        assert!(drawing.contains("<xdr:row>2</xdr:row>"));
        assert!(drawing.contains(r#"<xdr:ext cx="1260000" cy="540000"/>"#));
        assert!(drawing.contains(r#"<xdr:cNvPr id="1" name="logo.png"/>"#));
        let drawing_rels = Relationships::load(&package, "xl/drawings/drawing1.xml").unwrap();
        assert_eq!(drawing_rels.target_part("rId1").as_deref(), Some("xl/media/merge_image1.png"));

        let ct = package.text("[Content_Types].xml").unwrap().unwrap();
        assert!(ct.contains(r#"<Override PartName="/xl/drawings/drawing1.xml""#));
        assert!(ct.contains(r#"<Default Extension="png" ContentType="image/png"/>"#));
    }

    #[test]
    fn resized_two_cell_anchor_becomes_one_cell() {
        let dir = tempfile::tempdir().unwrap();
        let logo = png(dir.path(), "logo.png", 200, 100);
        let sheet1 = sheet("", r#"<drawing r:id="rId1"/>"#);
        let sheet_rels = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing" Target="../drawings/drawing1.xml"/></Relationships>"#;
        let drawing_rels = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="../media/image1.png"/></Relationships>"#;
        let drawing = r#"<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><xdr:twoCellAnchor editAs="oneCell"><xdr:from><xdr:col>0</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>0</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:to><xdr:col>2</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>2</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to><xdr:pic><xdr:nvPicPr><xdr:cNvPr id="2" name="Old"/><xdr:cNvPicPr/></xdr:nvPicPr><xdr:blipFill><a:blip r:embed="rId1"/></xdr:blipFill><xdr:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="720000" cy="360000"/></a:xfrm></xdr:spPr></xdr:pic><xdr:clientData/></xdr:twoCellAnchor></xdr:wsDr>"#;
        let path = write_xlsx(
            dir.path(),
            "",
            &sheet1,
            &sheet("", ""),
            &[
                ("xl/worksheets/_rels/sheet1.xml.rels", sheet_rels),
                ("xl/drawings/drawing1.xml", drawing),
                ("xl/drawings/_rels/drawing1.xml.rels", drawing_rels),
                ("xl/media/image1.png", "not really a png"),
            ],
        );
        let mut file = XlsxFile::open(&path).unwrap();
        let images = ImagePlaceholderMap::new(vec![ImagePlaceholder::new(
            "{{UNUSED}}",
            &logo,
            SizePolicy::AspectFit(Extent::from_cm(4.0, 4.0)),
        )])
        .unwrap();
        let report = apply_text_and_image_replacements(&mut file.workbook, &TokenMap::empty(), &images);
        assert_eq!(report.images_replaced, 1);

        let out = dir.path().join("out.xlsx");
        file.save(&out).unwrap();
        let package = Package::open(&out).unwrap();
        let xml = package.text("xl/drawings/drawing1.xml").unwrap().unwrap();
        assert!(xml.contains(
            r#"<xdr:oneCellAnchor><xdr:from><xdr:col>0</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>0</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:ext cx="1440000" cy="720000"/><xdr:pic>"#
        ));
        assert!(xml.contains(r#"<a:blip r:embed="rId2"/>"#));
        assert!(xml.contains(r#"<a:ext cx="1440000" cy="720000"/>"#));
        assert!(xml.ends_with("</xdr:oneCellAnchor></xdr:wsDr>"));
        // the sheet itself is untouched
        assert_eq!(
            package.text("xl/worksheets/sheet1.xml").unwrap().unwrap(),
            sheet1
        );
    }

    #[test]
    fn attribute_removal_handles_either_quote() {
        assert_eq!(without_attribute(r#" editAs="oneCell">"#, "editAs"), ">");
        assert_eq!(without_attribute(r#" a="1" editAs='x' b="2">"#, "editAs"), r#" a="1" b="2">"#);
        assert_eq!(without_attribute(">", "editAs"), ">");
    }

    #[test]
    fn attribute_values_escape_quotes() {
        let data = Arc::new(ImageData {
            path: PathBuf::from(r#"logo "v2".png"#),
            bytes: vec![0x89],
            format: image::ImageFormat::Png,
            pixel_width: 1,
            pixel_height: 1,
        });
        let image = ImageSpan::new(ImageSource::Inserted(data), Extent::from_cm(1.0, 1.0));
        let anchor = new_anchor("xdr:", 0, 0, 1, "rId1", &image);
        assert!(anchor.contains(r#"name="logo &quot;v2&quot;.png""#));
        let wrapped = format!(r#"<xdr:wsDr xmlns:xdr="{XDR_NS}">{anchor}</xdr:wsDr>"#);
        let doc = roxmltree::Document::parse(&wrapped).unwrap();
        let pic = doc
            .descendants()
            .find(|n| n.tag_name().name() == "cNvPr")
            .unwrap();
        assert_eq!(pic.attribute("name"), Some(r#"logo "v2".png"#));

        let mut xml = String::new();
        let format = FormatDescriptor {
            font_name: Some(r#"My "Serif""#.into()),
            ..Default::default()
        };
        push_run_props(&mut xml, &format);
        assert!(xml.contains(r#"<rFont val="My &quot;Serif&quot;"/>"#));
    }
}
