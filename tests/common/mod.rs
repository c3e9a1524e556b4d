#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

pub const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/></Types>"#;

pub const W_NS: &str = r#"xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture""#;

const REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

pub fn write_zip(path: &Path, parts: &[(&str, String)]) {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in parts {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    fs::write(path, buf.into_inner()).unwrap();
}

fn rels(items: &[(&str, &str, &str)]) -> String {
    let mut xml = String::from(
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (id, kind, target) in items {
        xml.push_str(&format!(
            r#"<Relationship Id="{id}" Type="{REL}/{kind}" Target="{target}"/>"#
        ));
    }
    xml.push_str("</Relationships>");
    xml
}

/// A `.docx` whose body is `body`, with an optional default header.
pub fn docx(dir: &Path, name: &str, body: &str, header: Option<&str>) -> PathBuf {
    let path = dir.join(name);
    let mut doc_rels = Vec::new();
    let mut sect = String::new();
    let mut parts = vec![
        ("[Content_Types].xml", CONTENT_TYPES.to_string()),
        ("_rels/.rels", rels(&[("rId1", "officeDocument", "word/document.xml")])),
    ];
    if let Some(header) = header {
        doc_rels.push(("rId10", "header", "header1.xml"));
        sect = r#"<w:sectPr><w:headerReference w:type="default" r:id="rId10"/></w:sectPr>"#.into();
        parts.push(("word/header1.xml", format!("<w:hdr {W_NS}>{header}</w:hdr>")));
    }
    parts.push((
        "word/document.xml",
        format!("<w:document {W_NS}><w:body>{body}{sect}</w:body></w:document>"),
    ));
    parts.push(("word/_rels/document.xml.rels", rels(&doc_rels)));
    write_zip(&path, &parts);
    path
}

/// A one-sheet `.xlsx` named "Sheet1".
pub fn xlsx(dir: &Path, name: &str, shared: &str, sheet_data: &str) -> PathBuf {
    let path = dir.join(name);
    let parts = vec![
        ("[Content_Types].xml", CONTENT_TYPES.to_string()),
        ("_rels/.rels", rels(&[("rId1", "officeDocument", "xl/workbook.xml")])),
        (
            "xl/workbook.xml",
            format!(
                r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="{REL}"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#
            ),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            rels(&[
                ("rId1", "worksheet", "worksheets/sheet1.xml"),
                ("rId2", "sharedStrings", "sharedStrings.xml"),
            ]),
        ),
        (
            "xl/sharedStrings.xml",
            format!(r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{shared}</sst>"#),
        ),
        (
            "xl/worksheets/sheet1.xml",
            format!(
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="{REL}"><sheetData>{sheet_data}</sheetData></worksheet>"#
            ),
        ),
    ];
    write_zip(&path, &parts);
    path
}

pub fn png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::new(width, height).save(&path).unwrap();
    path
}

pub fn part_text(path: &Path, part: &str) -> String {
    let package = docxside_merge::package::Package::open(path).unwrap();
    package.text(part).unwrap().unwrap()
}
