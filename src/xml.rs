use std::ops::Range;

pub(crate) const R_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
pub(crate) const DML_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
pub(crate) const PIC_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/picture";

pub(crate) fn is(node: roxmltree::Node, ns: &str, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == Some(ns)
}

pub(crate) fn child<'a>(
    node: roxmltree::Node<'a, 'a>,
    ns: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'a>> {
    node.children().find(|n| is(*n, ns, name))
}

pub(crate) fn descendant<'a>(
    node: roxmltree::Node<'a, 'a>,
    ns: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'a>> {
    node.descendants().find(|n| is(*n, ns, name))
}

/// Byte offset just past the `>` closing the start tag opened at `start`.
pub(crate) fn start_tag_end(xml: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in xml.as_bytes().iter().enumerate().skip(start) {
        match (quote, *b) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(*b),
            (None, b'>') => return Some(i + 1),
            _ => {}
        }
    }
    None
}

/// Start and end tag text of the element spanning `range`, minus the
/// attributes in `drop` (absolute ranges). A self-closing element yields
/// an explicit pair.
pub(crate) fn element_tags(
    xml: &str,
    range: &Range<usize>,
    drop: &[Range<usize>],
) -> Option<(String, String)> {
    let end = start_tag_end(xml, range.start)?;
    let mut open = String::with_capacity(end - range.start);
    let mut pos = range.start;
    for attr in drop {
        // the attribute and the whitespace before it
        let cut = xml[pos..attr.start].trim_end().len() + pos;
        open.push_str(&xml[pos..cut]);
        pos = attr.end;
    }
    open.push_str(&xml[pos..end]);
    if open.ends_with("/>") {
        open.truncate(open.len() - 2);
        let trimmed = open.trim_end().len();
        open.truncate(trimmed);
        open.push('>');
    }
    let name_end = open[1..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .map(|i| i + 1)?;
    let close = format!("</{}>", &open[1..name_end]);
    Some((open, close))
}

/// Applies non-overlapping replacements to `xml`.
pub(crate) fn splice(xml: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(xml.len());
    let mut pos = 0;
    for (range, text) in edits {
        out.push_str(&xml[pos..range.start]);
        out.push_str(&text);
        pos = range.end;
    }
    out.push_str(&xml[pos..]);
    out
}

/// Text of `node` as it appears in the source, including markup.
pub(crate) fn source<'a>(xml: &'a str, node: roxmltree::Node) -> &'a str {
    &xml[node.range()]
}
