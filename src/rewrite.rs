use std::collections::HashMap;
use std::ops::Range;

use crate::consolidate::Consolidated;
use crate::model::{CommitError, Extent, FormatDescriptor, ImageSource, ImageSpan, Span, Unit};

#[derive(Clone, Debug, PartialEq)]
pub enum Replacement {
    Text(String),
    /// A new picture where the matched text was.
    Insert(ImageSpan),
    /// New content for the picture owning the range; its placement is kept.
    Refill { source: ImageSource, extent: Extent },
}

/// A change to the logical text of a unit, in consolidated byte offsets.
#[derive(Clone, Debug, PartialEq)]
pub struct Edit {
    pub range: Range<usize>,
    pub replacement: Replacement,
}

/// Format of the span governing the first character of the edited range.
/// A token split over several runs therefore takes the first run's format.
pub fn inherited_format(unit: &Unit, consolidated: &Consolidated, range: &Range<usize>) -> FormatDescriptor {
    consolidated
        .span_at(range.start)
        .and_then(|i| unit.spans().get(i))
        .and_then(Span::as_text)
        .map(|t| t.format.clone())
        .unwrap_or_default()
}

/// Computes the unit's new span list.
///
/// Spans no edit touches are cloned unchanged. Inside a touched span the
/// untouched text keeps that span's format. An edit crossing span boundaries
/// merges the spans it covers into the format of its first span; the rest of
/// the last crossed span joins that format unless another edit starts in it.
/// `edits` must not overlap.
pub fn rebuild(unit: &Unit, consolidated: &Consolidated, edits: &[Edit]) -> Vec<Span> {
    let mut sorted: Vec<&Edit> = edits.iter().collect();
    sorted.sort_by_key(|e| e.range.start);

    let mut groups: Vec<(Range<usize>, Vec<&Edit>)> = Vec::new();
    let mut refills: HashMap<usize, &Edit> = HashMap::new();
    for edit in sorted {
        if let Replacement::Refill { .. } = edit.replacement {
            if let Some(span) = consolidated.span_at(edit.range.start) {
                refills.insert(span, edit);
            }
            continue;
        }
        let spans = consolidated.spans_in(&edit.range);
        if spans.is_empty() {
            continue;
        }
        match groups.last_mut() {
            Some((group, members)) if spans.start < group.end => {
                group.end = group.end.max(spans.end);
                members.push(edit);
            }
            _ => groups.push((spans, vec![edit])),
        }
    }

    let mut out = Vec::with_capacity(unit.spans().len() + edits.len());
    let mut groups = groups.into_iter().peekable();
    let mut index = 0;
    while index < unit.spans().len() {
        if let Some((group, members)) = groups.next_if(|(g, _)| g.start == index) {
            rebuild_group(unit, consolidated, &group, &members, &mut out);
            index = group.end;
            continue;
        }
        let span = &unit.spans()[index];
        match (span, refills.get(&index).map(|e| &e.replacement)) {
            (Span::Image(image), Some(Replacement::Refill { source, extent })) => {
                let mut image = image.clone();
                image.source = source.clone();
                image.extent = *extent;
                out.push(Span::Image(image));
            }
            _ => out.push(span.clone()),
        }
        index += 1;
    }
    out
}

fn rebuild_group(
    unit: &Unit,
    consolidated: &Consolidated,
    spans: &Range<usize>,
    members: &[&Edit],
    out: &mut Vec<Span>,
) {
    let end = consolidated
        .boundary(spans.end - 1)
        .map_or(consolidated.text.len(), |b| b.range.end);
    let mut pending = Pending::default();
    let mut pos = consolidated.boundary(spans.start).map_or(0, |b| b.range.start);
    let mut absorbed: Option<(usize, FormatDescriptor)> = None;
    for (i, edit) in members.iter().enumerate() {
        copy_untouched(unit, consolidated, spans, pos..edit.range.start, absorbed.as_ref(), &mut pending, out);
        let format = inherited_format(unit, consolidated, &edit.range);
        match &edit.replacement {
            Replacement::Text(value) => pending.push(value, &format, out),
            Replacement::Insert(image) => {
                pending.flush(out);
                out.push(Span::Image(image.clone()));
            }
            Replacement::Refill { .. } => {}
        }
        absorbed = crossed_tail(consolidated, edit, members.get(i + 1).copied()).map(|last| (last, format));
        pos = edit.range.end;
    }
    copy_untouched(unit, consolidated, spans, pos..end, absorbed.as_ref(), &mut pending, out);
    pending.flush(out);
}

/// The last span crossed by `edit`, when its remaining text has no edit of
/// its own.
fn crossed_tail(consolidated: &Consolidated, edit: &Edit, next: Option<&Edit>) -> Option<usize> {
    if edit.range.is_empty() {
        return None;
    }
    let first = consolidated.span_at(edit.range.start)?;
    let last = consolidated.span_at(edit.range.end - 1)?;
    if first == last {
        return None;
    }
    let tail_end = consolidated.boundary(last)?.range.end;
    match next {
        Some(next) if next.range.start < tail_end => None,
        _ => Some(last),
    }
}

/// Copies original text in `range`, cut at span boundaries, each piece in
/// its own span's format.
fn copy_untouched(
    unit: &Unit,
    consolidated: &Consolidated,
    spans: &Range<usize>,
    range: Range<usize>,
    absorbed: Option<&(usize, FormatDescriptor)>,
    pending: &mut Pending,
    out: &mut Vec<Span>,
) {
    for index in spans.clone() {
        let Some(boundary) = consolidated.boundary(index) else {
            continue;
        };
        let from = boundary.range.start.max(range.start);
        let to = boundary.range.end.min(range.end);
        if from >= to {
            continue;
        }
        match &unit.spans()[index] {
            Span::Image(image) => {
                pending.flush(out);
                out.push(Span::Image(image.clone()));
            }
            Span::Text(span) => {
                let format = match absorbed {
                    Some((last, format)) if *last == index => format,
                    _ => &span.format,
                };
                pending.push(&consolidated.text[from..to], format, out);
            }
        }
    }
}

/// Text waiting to become a span; neighbouring pieces of equal format share one.
#[derive(Default)]
struct Pending {
    text: String,
    format: FormatDescriptor,
}

impl Pending {
    fn push(&mut self, text: &str, format: &FormatDescriptor, out: &mut Vec<Span>) {
        if text.is_empty() {
            return;
        }
        if self.format != *format {
            self.flush(out);
            self.format = format.clone();
        }
        self.text.push_str(text);
    }

    fn flush(&mut self, out: &mut Vec<Span>) {
        if !self.text.is_empty() {
            out.push(Span::text(std::mem::take(&mut self.text), self.format.clone()));
        }
    }
}

/// Swaps `spans` into the unit. The unit is untouched when the backend
/// rules reject the new content.
pub fn commit(unit: &mut Unit, spans: Vec<Span>) -> Result<(), CommitError> {
    unit.replace_spans(spans)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::consolidate::{IMAGE_SENTINEL, consolidate};
    use crate::model::{Alignment, ImageData, UnitProps};

    fn fmt(bold: bool) -> FormatDescriptor {
        FormatDescriptor {
            bold: Some(bold),
            ..Default::default()
        }
    }

    fn text_edit(range: Range<usize>, value: &str) -> Edit {
        Edit {
            range,
            replacement: Replacement::Text(value.into()),
        }
    }

    fn inserted() -> ImageSpan {
        ImageSpan::new(
            ImageSource::Inserted(Arc::new(ImageData {
                path: PathBuf::from("logo.png"),
                bytes: vec![0x89],
                format: image::ImageFormat::Png,
                pixel_width: 10,
                pixel_height: 10,
            })),
            Extent::from_cm(1.0, 1.0),
        )
    }

    #[test]
    fn split_token_takes_first_run_format() {
        let unit = Unit::paragraph(vec![
            Span::text("Dear {{NA", fmt(true)),
            Span::text("ME}},", fmt(false)),
        ]);
        let c = consolidate(&unit);
        let spans = rebuild(&unit, &c, &[text_edit(5..13, "Ada Lovelace")]);
        assert_eq!(spans, vec![Span::text("Dear Ada Lovelace,", fmt(true))]);
    }

    #[test]
    fn untouched_spans_pass_through() {
        let unit = Unit::paragraph(vec![
            Span::text("Hello ", fmt(true)),
            Span::text("{{X}}", fmt(false)),
            Span::text(" bye", fmt(true)),
        ]);
        let c = consolidate(&unit);
        let spans = rebuild(&unit, &c, &[text_edit(6..11, "world")]);
        assert_eq!(spans[0], unit.spans()[0]);
        assert_eq!(spans[1], Span::text("world", fmt(false)));
        assert_eq!(spans[2], unit.spans()[2]);
    }

    #[test]
    fn inserted_picture_splits_only_its_run() {
        let unit = Unit::paragraph(vec![
            Span::text("keep", fmt(true)),
            Span::text("a {{LOGO}} b", fmt(false)),
        ]);
        let c = consolidate(&unit);
        let picture = inserted();
        let edits = [Edit {
            range: 6..14,
            replacement: Replacement::Insert(picture.clone()),
        }];
        let spans = rebuild(&unit, &c, &edits);
        assert_eq!(
            spans,
            vec![
                unit.spans()[0].clone(),
                Span::text("a ", fmt(false)),
                Span::Image(picture),
                Span::text(" b", fmt(false)),
            ]
        );
    }

    #[test]
    fn refill_keeps_picture_placement() {
        let mut original = ImageSpan::new(
            ImageSource::Embedded { rel_id: "rId7".into() },
            Extent::from_cm(5.0, 5.0),
        );
        original.anchor_id = 4;
        let unit = Unit::paragraph(vec![Span::text("x", fmt(false)), Span::Image(original)]);
        let c = consolidate(&unit);
        let new_source = inserted().source;
        let edits = [Edit {
            range: 1..1 + IMAGE_SENTINEL.len_utf8(),
            replacement: Replacement::Refill {
                source: new_source.clone(),
                extent: Extent::from_cm(2.0, 1.0),
            },
        }];
        let spans = rebuild(&unit, &c, &edits);
        let image = spans[1].as_image().unwrap();
        assert_eq!(image.anchor_id, 4);
        assert_eq!(image.source, new_source);
        assert_eq!(image.extent, Extent::from_cm(2.0, 1.0));
        assert_eq!(spans[0], unit.spans()[0]);
    }

    #[test]
    fn edits_sharing_a_run_rebuild_it_once() {
        let unit = Unit::paragraph(vec![
            Span::text("{{A}}-{{", fmt(true)),
            Span::text("B}}", fmt(false)),
        ]);
        let c = consolidate(&unit);
        let spans = rebuild(&unit, &c, &[text_edit(0..5, "a"), text_edit(6..11, "b")]);
        assert_eq!(spans, vec![Span::text("a-b", fmt(true))]);
    }

    fn italic() -> FormatDescriptor {
        FormatDescriptor {
            italic: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn token_inside_a_crossed_run_keeps_that_runs_format() {
        let unit = Unit::paragraph(vec![
            Span::text("Dear {{A", fmt(true)),
            Span::text("}}, see {{B}} now", italic()),
        ]);
        let c = consolidate(&unit);
        let spans = rebuild(&unit, &c, &[text_edit(5..10, "Ada"), text_edit(16..21, "Bob")]);
        assert_eq!(
            spans,
            vec![
                Span::text("Dear Ada", fmt(true)),
                Span::text(", see Bob now", italic()),
            ]
        );
    }

    #[test]
    fn crossed_run_tail_joins_the_first_format() {
        let unit = Unit::paragraph(vec![
            Span::text("{{A", fmt(true)),
            Span::text("}} mid ", italic()),
            Span::text("{{B}} end", fmt(false)),
        ]);
        let c = consolidate(&unit);
        let spans = rebuild(&unit, &c, &[text_edit(0..5, "Ada"), text_edit(10..15, "Bob")]);
        assert_eq!(
            spans,
            vec![
                Span::text("Ada mid ", fmt(true)),
                Span::text("Bob end", fmt(false)),
            ]
        );
    }

    #[test]
    fn untouched_text_between_edits_keeps_each_runs_format() {
        let unit = Unit::paragraph(vec![
            Span::text("{{A}} x", fmt(true)),
            Span::text(" y {{B", italic()),
            Span::text("}}", fmt(false)),
        ]);
        let c = consolidate(&unit);
        // the first edit stays in its run, the second crosses into the last one
        let spans = rebuild(&unit, &c, &[text_edit(0..5, "a"), text_edit(10..15, "b")]);
        assert_eq!(
            spans,
            vec![
                Span::text("a x", fmt(true)),
                Span::text(" y b", italic()),
            ]
        );
    }

    #[test]
    fn commit_keeps_unit_properties() {
        let mut props = UnitProps::default();
        props.alignment = Some(Alignment::Center);
        props.style = Some("Title".into());
        let mut unit = Unit::paragraph(vec![Span::text("{{X}}", fmt(false))]).with_props(props.clone());
        commit(&mut unit, vec![Span::text("done", fmt(false))]).unwrap();
        assert_eq!(unit.props(), &props);
        assert!(unit.is_rewritten());
    }
}
