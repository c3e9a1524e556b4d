use std::ops::Range;

use crate::model::{Span, Unit};

/// Stands in for an image span in the logical text. Token keys may not
/// contain it, so no match can run through a picture.
pub const IMAGE_SENTINEL: char = '\u{FFFC}';

/// Byte range of the logical text owned by one span of the unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanBoundary {
    pub range: Range<usize>,
    pub span: usize,
}

/// A unit's spans flattened into one string plus the map back to the spans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Consolidated {
    pub text: String,
    pub boundaries: Vec<SpanBoundary>,
}

impl Consolidated {
    /// Index of the span governing the character at `offset`. Empty text
    /// spans own no characters and are never returned.
    pub fn span_at(&self, offset: usize) -> Option<usize> {
        let i = self.boundaries.partition_point(|b| b.range.end <= offset);
        self.boundaries
            .get(i)
            .filter(|b| b.range.contains(&offset))
            .map(|b| b.span)
    }

    /// Spans whose characters intersect `range`, in order.
    pub fn spans_in(&self, range: &Range<usize>) -> Range<usize> {
        let mut owners = self
            .boundaries
            .iter()
            .filter(|b| b.range.start < range.end && range.start < b.range.end)
            .map(|b| b.span);
        match owners.next() {
            Some(first) => first..owners.last().unwrap_or(first) + 1,
            None => 0..0,
        }
    }

    pub fn boundary(&self, span: usize) -> Option<&SpanBoundary> {
        self.boundaries.iter().find(|b| b.span == span)
    }

    pub fn image_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.text.match_indices(IMAGE_SENTINEL).map(|(i, _)| i)
    }
}

pub fn consolidate(unit: &Unit) -> Consolidated {
    let mut text = String::new();
    let mut boundaries = Vec::with_capacity(unit.spans().len());
    for (index, span) in unit.spans().iter().enumerate() {
        let start = text.len();
        match span {
            Span::Text(t) => text.push_str(&t.text),
            Span::Image(_) => text.push(IMAGE_SENTINEL),
        }
        if text.len() > start {
            boundaries.push(SpanBoundary {
                range: start..text.len(),
                span: index,
            });
        }
    }
    Consolidated { text, boundaries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Extent, FormatDescriptor, ImageSource, ImageSpan};

    fn bold() -> FormatDescriptor {
        FormatDescriptor {
            bold: Some(true),
            ..Default::default()
        }
    }

    fn picture() -> Span {
        Span::Image(ImageSpan::new(
            ImageSource::Embedded { rel_id: "rId5".into() },
            Extent::from_cm(1.0, 1.0),
        ))
    }

    #[test]
    fn concatenates_runs_and_maps_offsets() {
        let unit = Unit::paragraph(vec![
            Span::text("Dear {{NA", bold()),
            Span::text("", FormatDescriptor::default()),
            Span::text("ME}},", FormatDescriptor::default()),
        ]);
        let c = consolidate(&unit);
        assert_eq!(c.text, "Dear {{NAME}},");
        assert_eq!(c.span_at(0), Some(0));
        assert_eq!(c.span_at(8), Some(0));
        assert_eq!(c.span_at(9), Some(2));
        assert_eq!(c.span_at(14), None);
        assert_eq!(c.spans_in(&(5..13)), 0..3);
        assert_eq!(c.spans_in(&(0..4)), 0..1);
    }

    #[test]
    fn images_occupy_one_sentinel() {
        let unit = Unit::paragraph(vec![
            Span::text("a", FormatDescriptor::default()),
            picture(),
            Span::text("b", FormatDescriptor::default()),
        ]);
        let c = consolidate(&unit);
        assert_eq!(c.text, format!("a{IMAGE_SENTINEL}b"));
        assert_eq!(c.image_offsets().collect::<Vec<_>>(), vec![1]);
        assert_eq!(c.span_at(1), Some(1));
        assert_eq!(c.span_at(1 + IMAGE_SENTINEL.len_utf8()), Some(2));
    }

    #[test]
    fn multibyte_text_keeps_byte_offsets() {
        let unit = Unit::paragraph(vec![
            Span::text("Grüße ", FormatDescriptor::default()),
            Span::text("{{X}}", bold()),
        ]);
        let c = consolidate(&unit);
        let start = c.text.find("{{X}}").unwrap();
        assert_eq!(c.span_at(start), Some(1));
        assert_eq!(c.boundary(1).unwrap().range, start..c.text.len());
    }
}
