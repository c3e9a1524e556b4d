use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;

use crate::error::Error;

const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const CT_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

pub const REL_OFFICE_DOCUMENT: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
pub const REL_IMAGE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
pub const REL_HEADER: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/header";
pub const REL_FOOTER: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/footer";
pub const REL_DRAWING: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing";
pub const REL_SHARED_STRINGS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";
pub const REL_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";

pub const CT_DRAWING: &str = "application/vnd.openxmlformats-officedocument.drawing+xml";

/// An OPC package held in memory: every ZIP entry in archive order.
#[derive(Clone, Debug)]
pub struct Package {
    path: PathBuf,
    entries: Vec<(String, Vec<u8>)>,
}

impl Package {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.push((name, data));
        }
        log::debug!("Opened {} ({} parts)", path.display(), entries.len());
        Ok(Package {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// A part decoded as UTF-8, or `None` when the package has no such part.
    pub fn text(&self, name: &str) -> Result<Option<String>, Error> {
        let Some(bytes) = self.bytes(name) else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidPackage(format!("{name} is not UTF-8")))?;
        Ok(Some(text))
    }

    /// Replaces a part, or appends it when new.
    pub fn put(&mut self, name: &str, data: Vec<u8>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = data,
            None => self.entries.push((name.to_string(), data)),
        }
    }

    /// First free `{stem}{n}.{ext}` name, counting from 1.
    pub fn unique_part_name(&self, stem: &str, ext: &str) -> String {
        (1..)
            .map(|n| format!("{stem}{n}.{ext}"))
            .find(|name| !self.contains(name))
            .unwrap_or_else(|| format!("{stem}.{ext}"))
    }

    /// Writes the package to `path` through a temporary file in the same
    /// directory, renamed into place once complete.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if same_file(&self.path, path) {
            return Err(Error::SamePath(path.to_path_buf()));
        }
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut zip = zip::ZipWriter::new(tmp.as_file_mut());
            let deflated = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            let stored = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, data) in &self.entries {
                let opts = if is_media(name) { stored } else { deflated };
                zip.start_file(name.as_str(), opts)?;
                zip.write_all(data)?;
            }
            zip.finish()?;
        }
        tmp.persist(path)?;
        log::debug!("Saved {}", path.display());
        Ok(())
    }
}

fn is_media(name: &str) -> bool {
    name.contains("/media/")
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `word/document.xml` → `word/_rels/document.xml.rels`
pub fn rels_part_name(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn part_dir(part: &str) -> &str {
    part.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Resolves a relationship target relative to its source part into a
/// package part name.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    let joined = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None if part_dir(source_part).is_empty() => target.to_string(),
        None => format!("{}/{target}", part_dir(source_part)),
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Target string that reaches `target_part` from `source_part`.
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    let from: Vec<&str> = part_dir(source_part).split('/').filter(|s| !s.is_empty()).collect();
    let to: Vec<&str> = target_part.split('/').collect();
    let common = from
        .iter()
        .zip(&to)
        .take_while(|(a, b)| a == b)
        .count()
        .min(to.len().saturating_sub(1));
    let mut out: Vec<&str> = vec![".."; from.len() - common];
    out.extend(&to[common..]);
    out.join("/")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// The relationships of one source part.
#[derive(Clone, Debug)]
pub struct Relationships {
    source: String,
    items: Vec<Relationship>,
}

impl Relationships {
    pub fn load(package: &Package, source_part: &str) -> Result<Self, Error> {
        let mut items = Vec::new();
        if let Some(xml) = package.text(&rels_part_name(source_part))? {
            let doc = roxmltree::Document::parse(&xml)?;
            for node in doc.root_element().children() {
                if node.tag_name().name() != "Relationship"
                    || node.tag_name().namespace() != Some(RELS_NS)
                {
                    continue;
                }
                let (Some(id), Some(rel_type), Some(target)) = (
                    node.attribute("Id"),
                    node.attribute("Type"),
                    node.attribute("Target"),
                ) else {
                    continue;
                };
                items.push(Relationship {
                    id: id.to_string(),
                    rel_type: rel_type.to_string(),
                    target: target.to_string(),
                    external: node.attribute("TargetMode") == Some("External"),
                });
            }
        }
        Ok(Relationships {
            source: source_part.to_string(),
            items,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Relationship> {
        self.items.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.items.iter()
    }

    /// Package part an internal relationship points at.
    pub fn target_part(&self, id: &str) -> Option<String> {
        self.get(id)
            .filter(|r| !r.external)
            .map(|r| resolve_target(&self.source, &r.target))
    }

    pub fn first_of_type(&self, rel_type: &str) -> Option<&Relationship> {
        self.items.iter().find(|r| r.rel_type == rel_type)
    }

    /// Adds a relationship from the source part to `target_part` and
    /// returns its fresh id.
    pub fn add(&mut self, rel_type: &str, target_part: &str) -> String {
        let id = (1..)
            .map(|n| format!("rId{n}"))
            .find(|id| self.get(id).is_none())
            .unwrap_or_else(|| format!("rId{}", self.items.len() + 1));
        self.items.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: relative_target(&self.source, target_part),
            external: false,
        });
        id
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\r\n",
        );
        xml.push_str(&format!("<Relationships xmlns=\"{RELS_NS}\">"));
        for r in &self.items {
            xml.push_str(&format!(
                "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"",
                escape(&r.id),
                escape(&r.rel_type),
                escape(&r.target)
            ));
            if r.external {
                xml.push_str(" TargetMode=\"External\"");
            }
            xml.push_str("/>");
        }
        xml.push_str("</Relationships>");
        xml
    }

    pub fn store(&self, package: &mut Package) {
        package.put(&rels_part_name(&self.source), self.to_xml().into_bytes());
    }
}

/// `[Content_Types].xml`, extended by appending entries before the closing
/// tag so the original declarations stay byte-identical.
#[derive(Clone, Debug)]
pub struct ContentTypes {
    xml: String,
    defaults: Vec<String>,
    overrides: Vec<String>,
    added: String,
}

const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

impl ContentTypes {
    pub fn load(package: &Package) -> Result<Self, Error> {
        let xml = package
            .text(CONTENT_TYPES_PART)?
            .ok_or_else(|| Error::InvalidPackage(format!("{CONTENT_TYPES_PART} is missing")))?;
        let mut defaults = Vec::new();
        let mut overrides = Vec::new();
        {
            let doc = roxmltree::Document::parse(&xml)?;
            for node in doc.root_element().children().filter(|n| n.is_element()) {
                if node.tag_name().namespace() != Some(CT_NS) {
                    continue;
                }
                match node.tag_name().name() {
                    "Default" => {
                        if let Some(ext) = node.attribute("Extension") {
                            defaults.push(ext.to_ascii_lowercase());
                        }
                    }
                    "Override" => {
                        if let Some(part) = node.attribute("PartName") {
                            overrides.push(part.trim_start_matches('/').to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(ContentTypes {
            xml,
            defaults,
            overrides,
            added: String::new(),
        })
    }

    pub fn ensure_default(&mut self, extension: &str, content_type: &str) {
        let ext = extension.to_ascii_lowercase();
        if self.defaults.contains(&ext) {
            return;
        }
        self.added.push_str(&format!(
            "<Default Extension=\"{}\" ContentType=\"{}\"/>",
            escape(&ext),
            escape(content_type)
        ));
        self.defaults.push(ext);
    }

    pub fn ensure_override(&mut self, part: &str, content_type: &str) {
        if self.overrides.iter().any(|p| p == part) {
            return;
        }
        self.added.push_str(&format!(
            "<Override PartName=\"/{}\" ContentType=\"{}\"/>",
            escape(part),
            escape(content_type)
        ));
        self.overrides.push(part.to_string());
    }

    pub fn store(&self, package: &mut Package) -> Result<(), Error> {
        if self.added.is_empty() {
            return Ok(());
        }
        let Some(close) = self.xml.rfind("</") else {
            return Err(Error::InvalidPackage(format!("{CONTENT_TYPES_PART} has no root end tag")));
        };
        let mut xml = String::with_capacity(self.xml.len() + self.added.len());
        xml.push_str(&self.xml[..close]);
        xml.push_str(&self.added);
        xml.push_str(&self.xml[close..]);
        package.put(CONTENT_TYPES_PART, xml.into_bytes());
        Ok(())
    }
}
