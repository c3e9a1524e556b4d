use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use quick_xml::escape::{escape, partial_escape};

use super::DocxFile;
use crate::error::Error;
use crate::model::{ImageData, ImageSource, ImageSpan, Span, TextSpan, Unit};
use crate::package::{ContentTypes, Package, REL_IMAGE, Relationships};
use crate::xml::splice;

/// Media and relationship bookkeeping shared by every rewritten part.
struct MediaWriter<'p> {
    package: &'p mut Package,
    content_types: ContentTypes,
    rels: HashMap<usize, Relationships>,
    /// (part index, image) → relationship id, so an image inserted several
    /// times into one part is stored once.
    embedded: HashMap<(usize, *const ImageData), String>,
    next_drawing_id: u32,
}

pub(super) fn write_back(file: &DocxFile, package: &mut Package) -> Result<(), Error> {
    let mut rewritten: HashMap<usize, Vec<&Unit>> = HashMap::new();
    for unit in file.document.all_units() {
        if let (true, Some(origin)) = (unit.is_rewritten(), &unit.origin) {
            rewritten.entry(origin.part).or_default().push(unit);
        }
    }
    if rewritten.is_empty() {
        log::debug!("No rewritten paragraphs, copying package unchanged");
        return Ok(());
    }

    let mut media = MediaWriter {
        content_types: ContentTypes::load(package)?,
        package,
        rels: HashMap::new(),
        embedded: HashMap::new(),
        next_drawing_id: file.max_drawing_id + 1,
    };

    let mut indices: Vec<usize> = rewritten.keys().copied().collect();
    indices.sort_unstable();
    for index in indices {
        let Some(part) = file.parts.get(index) else {
            continue;
        };
        let units = &rewritten[&index];
        let mut edits: Vec<(Range<usize>, String)> = Vec::with_capacity(units.len());
        for unit in units {
            let Some(origin) = &unit.origin else {
                continue;
            };
            let mut xml = origin.open_tag.clone();
            if let Some(ppr) = &unit.props().native {
                xml.push_str(ppr);
            }
            for span in unit.spans() {
                match span {
                    Span::Text(text) => push_text_run(&mut xml, text),
                    Span::Image(image) => {
                        let run = media.image_run(index, &part.name, image)?;
                        xml.push_str(&run);
                    }
                }
            }
            xml.push_str(&origin.close_tag);
            edits.push((origin.range.clone(), xml));
        }
        log::debug!("Rewriting {} paragraphs in {}", edits.len(), part.name);
        let xml = splice(&part.xml, edits);
        media.package.put(&part.name, xml.into_bytes());
    }

    for rels in media.rels.values() {
        rels.store(media.package);
    }
    media.content_types.store(media.package)
}

/// One `w:r` per text span; tabs, breaks and special hyphens become their
/// run content elements.
fn push_text_run(xml: &mut String, span: &TextSpan) {
    xml.push_str("<w:r>");
    if let Some(rpr) = &span.format.native {
        xml.push_str(rpr);
    }
    let text = span.text.replace("\r\n", "\n");
    let mut pending = String::new();
    for c in text.chars() {
        let element = match c {
            '\t' => "<w:tab/>",
            '\n' | '\r' => "<w:br/>",
            '\u{AD}' => "<w:softHyphen/>",
            '\u{2011}' => "<w:noBreakHyphen/>",
            c => {
                pending.push(c);
                continue;
            }
        };
        flush_text(xml, &mut pending);
        xml.push_str(element);
    }
    flush_text(xml, &mut pending);
    xml.push_str("</w:r>");
}

fn flush_text(xml: &mut String, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    xml.push_str("<w:t xml:space=\"preserve\">");
    xml.push_str(&partial_escape(pending.as_str()));
    xml.push_str("</w:t>");
    pending.clear();
}

impl MediaWriter<'_> {
    fn image_run(&mut self, part: usize, part_name: &str, image: &ImageSpan) -> Result<String, Error> {
        let rel_id = match &image.source {
            ImageSource::Embedded { rel_id } => rel_id.clone(),
            ImageSource::Inserted(data) => self.embed(part, part_name, data)?,
        };
        let mut run = String::from("<w:r>");
        match &image.native {
            Some(native) => {
                if let Some(rpr) = &native.run_props {
                    run.push_str(rpr);
                }
                let mut edits = vec![(native.embed.clone(), rel_id)];
                for (cx, cy) in &native.extents {
                    edits.push((cx.clone(), image.extent.cx.to_string()));
                    edits.push((cy.clone(), image.extent.cy.to_string()));
                }
                run.push_str(&splice(&native.xml, edits));
            }
            None => {
                let id = self.next_drawing_id;
                self.next_drawing_id += 1;
                let name = match &image.source {
                    ImageSource::Inserted(data) => data
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    ImageSource::Embedded { .. } => String::new(),
                };
                run.push_str(&inline_drawing(id, &name, &rel_id, image));
            }
        }
        run.push_str("</w:r>");
        Ok(run)
    }

    fn embed(&mut self, part: usize, part_name: &str, data: &Arc<ImageData>) -> Result<String, Error> {
        let key = (part, Arc::as_ptr(data));
        if let Some(id) = self.embedded.get(&key) {
            return Ok(id.clone());
        }
        let ext = data.extension();
        let media_part = self.package.unique_part_name("word/media/merge_image", ext);
        self.package.put(&media_part, data.bytes.clone());
        self.content_types.ensure_default(ext, data.content_type());

        let rels = match self.rels.entry(part) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(Relationships::load(self.package, part_name)?)
            }
        };
        let id = rels.add(REL_IMAGE, &media_part);
        log::debug!("Embedded {} as {media_part} ({id})", data.path.display());
        self.embedded.insert(key, id.clone());
        Ok(id)
    }
}

fn inline_drawing(id: u32, name: &str, rel_id: &str, image: &ImageSpan) -> String {
    let (cx, cy) = (image.extent.cx, image.extent.cy);
    let name = escape(name);
    format!(
        concat!(
            r#"<w:drawing><wp:inline distT="0" distB="0" distL="0" distR="0" xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing">"#,
            r#"<wp:extent cx="{cx}" cy="{cy}"/><wp:docPr id="{id}" name="Picture {id}"/>"#,
            r#"<wp:cNvGraphicFramePr><a:graphicFrameLocks xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" noChangeAspect="1"/></wp:cNvGraphicFramePr>"#,
            r#"<a:graphic xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/picture">"#,
            r#"<pic:pic xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture"><pic:nvPicPr><pic:cNvPr id="0" name="{name}"/><pic:cNvPicPr/></pic:nvPicPr>"#,
            r#"<pic:blipFill><a:blip xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" r:embed="{rel_id}"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill>"#,
            r#"<pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr>"#,
            r#"</pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing>"#,
        ),
        cx = cx,
        cy = cy,
        id = id,
        name = name,
        rel_id = rel_id,
    )
}
