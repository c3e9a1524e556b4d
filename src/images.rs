use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};

use crate::consolidate::{Consolidated, IMAGE_SENTINEL};
use crate::error::Error;
use crate::model::{Extent, ImageData, Span, Unit};

/// How big a replacement picture is drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizePolicy {
    Fixed(Extent),
    /// Largest size inside the box that keeps the image's own aspect ratio.
    AspectFit(Extent),
    /// Size of the picture being replaced, or the image's natural size when
    /// there is none.
    InheritOriginal,
}

impl SizePolicy {
    pub fn extent_for(&self, data: &ImageData, original: Option<Extent>) -> Extent {
        match *self {
            SizePolicy::Fixed(extent) => extent,
            SizePolicy::AspectFit(bounds) => aspect_fit(data.pixel_width, data.pixel_height, bounds),
            SizePolicy::InheritOriginal => original
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| data.natural_extent()),
        }
    }
}

pub fn aspect_fit(pixel_width: u32, pixel_height: u32, bounds: Extent) -> Extent {
    if pixel_width == 0 || pixel_height == 0 {
        return bounds;
    }
    let (pw, ph) = (pixel_width as f64, pixel_height as f64);
    let scale = (bounds.cx as f64 / pw).min(bounds.cy as f64 / ph);
    Extent {
        cx: (pw * scale).round() as i64,
        cy: (ph * scale).round() as i64,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImagePlaceholder {
    pub marker: String,
    pub path: PathBuf,
    pub size: SizePolicy,
}

impl ImagePlaceholder {
    pub fn new(marker: impl Into<String>, path: impl Into<PathBuf>, size: SizePolicy) -> Self {
        ImagePlaceholder {
            marker: marker.into(),
            path: path.into(),
            size,
        }
    }
}

/// Marker → image mapping. Declaration order drives both tie-breaking and
/// the positional assignment of entries to pictures already in a document.
#[derive(Clone, Debug)]
pub struct ImagePlaceholderMap {
    entries: Vec<ImagePlaceholder>,
    markers: Option<AhoCorasick>,
    replace_existing: bool,
}

impl Default for ImagePlaceholderMap {
    fn default() -> Self {
        ImagePlaceholderMap {
            entries: Vec::new(),
            markers: None,
            replace_existing: true,
        }
    }
}

impl ImagePlaceholderMap {
    pub fn new(entries: Vec<ImagePlaceholder>) -> Result<Self, Error> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.marker.is_empty() {
                return Err(Error::Config("image markers must not be empty".into()));
            }
            if entry.marker.contains(IMAGE_SENTINEL) {
                return Err(Error::Config(format!(
                    "image marker {:?} contains U+FFFC, which is reserved for images",
                    entry.marker
                )));
            }
            if entries[..i].iter().any(|e| e.marker == entry.marker) {
                return Err(Error::Config(format!("image marker {:?} given twice", entry.marker)));
            }
        }
        let markers = if entries.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(entries.iter().map(|e| e.marker.as_str()))?,
            )
        };
        Ok(ImagePlaceholderMap {
            entries,
            markers,
            replace_existing: true,
        })
    }

    /// Whether pictures already in the document are replaced as well.
    pub fn with_replace_existing(mut self, replace_existing: bool) -> Self {
        self.replace_existing = replace_existing;
        self
    }

    pub fn replace_existing(&self) -> bool {
        self.replace_existing
    }

    pub fn entries(&self) -> &[ImagePlaceholder] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Leftmost-longest marker occurrences inside `range`.
    pub fn find_markers(&self, text: &str, range: Range<usize>) -> Vec<(Range<usize>, &ImagePlaceholder)> {
        let Some(ac) = &self.markers else {
            return Vec::new();
        };
        ac.find_iter(aho_corasick::Input::new(&text[..range.end]).range(range.start..))
            .map(|m| (m.range(), &self.entries[m.pattern().as_usize()]))
            .collect()
    }

    pub fn mentions(&self, text: &str) -> bool {
        self.markers.as_ref().is_some_and(|ac| ac.is_match(text))
    }

    pub fn cursor(&self) -> ExistingImageCursor<'_> {
        ExistingImageCursor { map: self, next: 0 }
    }
}

/// Hands out placeholder entries to pre-existing pictures in the order the
/// pictures are met. A single entry covers every picture; with several,
/// each picture consumes the next one until they run out.
#[derive(Debug)]
pub struct ExistingImageCursor<'a> {
    map: &'a ImagePlaceholderMap,
    next: usize,
}

impl<'a> ExistingImageCursor<'a> {
    pub fn next_entry(&mut self) -> Option<&'a ImagePlaceholder> {
        if !self.map.replace_existing {
            return None;
        }
        match self.map.entries.as_slice() {
            [] => None,
            [only] => Some(only),
            entries => {
                let entry = entries.get(self.next)?;
                self.next += 1;
                Some(entry)
            }
        }
    }

    pub fn consumed(&self) -> usize {
        self.next
    }
}

/// A picture to put somewhere in a unit.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageEdit<'a> {
    /// Marker text at `range` of the logical text becomes a picture.
    Marker {
        range: Range<usize>,
        placeholder: &'a ImagePlaceholder,
    },
    /// The picture at span index `span` gets new content.
    Existing {
        span: usize,
        offset: usize,
        original: Extent,
        placeholder: &'a ImagePlaceholder,
    },
}

impl<'a> ImageEdit<'a> {
    pub fn offset(&self) -> usize {
        match self {
            ImageEdit::Marker { range, .. } => range.start,
            ImageEdit::Existing { offset, .. } => *offset,
        }
    }

    pub fn placeholder(&self) -> &'a ImagePlaceholder {
        match self {
            ImageEdit::Marker { placeholder, .. } | ImageEdit::Existing { placeholder, .. } => {
                placeholder
            }
        }
    }

    /// Size of the picture being replaced, if any.
    pub fn original(&self) -> Option<Extent> {
        match self {
            ImageEdit::Marker { .. } => None,
            ImageEdit::Existing { original, .. } => Some(*original),
        }
    }
}

/// Finds both kinds of image edits in a unit, ordered by position.
///
/// Marker text is matched inside text only, never across a picture.
/// Pre-existing pictures each draw one entry from `cursor`.
pub fn resolve_images<'a>(
    unit: &Unit,
    consolidated: &Consolidated,
    map: &'a ImagePlaceholderMap,
    cursor: &mut ExistingImageCursor<'a>,
) -> Vec<ImageEdit<'a>> {
    let mut edits = Vec::new();
    for segment in crate::resolve::segments(&consolidated.text, &[]) {
        for (range, placeholder) in map.find_markers(&consolidated.text, segment) {
            edits.push(ImageEdit::Marker { range, placeholder });
        }
    }
    for (span, image) in unit.spans().iter().enumerate().filter_map(|(i, s)| match s {
        Span::Image(image) => Some((i, image)),
        Span::Text(_) => None,
    }) {
        let Some(placeholder) = cursor.next_entry() else {
            break;
        };
        let offset = consolidated.boundary(span).map_or(0, |b| b.range.start);
        edits.push(ImageEdit::Existing {
            span,
            offset,
            original: image.extent,
            placeholder,
        });
    }
    edits.sort_by_key(ImageEdit::offset);
    edits
}

/// Reads and probes image files, once per path per document.
#[derive(Debug, Default)]
pub struct ImageLoader {
    cache: HashMap<PathBuf, Result<Arc<ImageData>, String>>,
}

impl ImageLoader {
    pub fn new() -> Self {
        ImageLoader::default()
    }

    /// The decoded header of the image at `path`, or why it is unusable.
    pub fn load(&mut self, path: &Path) -> Result<Arc<ImageData>, String> {
        self.cache
            .entry(path.to_path_buf())
            .or_insert_with(|| probe(path).map(Arc::new))
            .clone()
    }
}

fn probe(path: &Path) -> Result<ImageData, String> {
    if !path.is_file() {
        return Err(format!("image file {} does not exist", path.display()));
    }
    let bytes = fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let reader = image::ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let Some(format) = reader.format() else {
        return Err(format!("{} is not a recognised image format", path.display()));
    };
    let (pixel_width, pixel_height) = reader
        .into_dimensions()
        .map_err(|e| format!("cannot decode {}: {e}", path.display()))?;
    log::debug!(
        "Loaded {} ({format:?}, {pixel_width}x{pixel_height})",
        path.display()
    );
    Ok(ImageData {
        path: path.to_path_buf(),
        bytes,
        format,
        pixel_width,
        pixel_height,
    })
}
