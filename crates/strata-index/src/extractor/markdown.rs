//! Markdown sections split on heading boundaries.

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use strata_memory::{MetaKey, Metadata};

use crate::chunk::{Chunk, ChunkType, Layer};

use super::line_of;

struct Heading {
    start: usize,
    level: usize,
    text: String,
}

/// One chunk per heading, spanning to the next heading of equal or higher level, so
/// parent sections contain their subsections. Text before the first heading becomes
/// a level-0 section titled `document_name`.
pub(super) fn extract(source: &str, document_name: &str) -> Vec<Chunk> {
    let headings = headings(source);
    let mut sections: Vec<(usize, usize, usize, String)> = Vec::new();

    let preamble_end = headings.first().map_or(source.len(), |h| h.start);
    if !source[..preamble_end].trim().is_empty() {
        sections.push((0, preamble_end, 0, document_name.to_owned()));
    }
    for (i, heading) in headings.iter().enumerate() {
        let end = headings[i + 1..]
            .iter()
            .find(|next| next.level <= heading.level)
            .map_or(source.len(), |next| next.start);
        sections.push((heading.start, end, heading.level, heading.text.clone()));
    }

    sections
        .into_iter()
        .enumerate()
        .map(|(index, (start, end, level, heading))| {
            let content = source[start..end].trim_end();
            let line_start = line_of(source, start);
            let line_end = line_start + content.lines().count().saturating_sub(1);
            Chunk {
                content: content.to_owned(),
                metadata: Metadata::new()
                    .with(MetaKey::ChunkType, ChunkType::Documentation.as_str())
                    .with(MetaKey::Layer, Layer::Documentation.as_str())
                    .with(MetaKey::DocumentName, document_name)
                    .with(MetaKey::Heading, heading)
                    .with(MetaKey::HeadingLevel, level)
                    .with(MetaKey::LineStart, line_start)
                    .with(MetaKey::LineEnd, line_end)
                    .with_extra("section_index", index),
            }
        })
        .collect()
}

fn headings(source: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut current: Option<Heading> = None;
    for (event, range) in Parser::new(source).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                current = Some(Heading {
                    start: range.start,
                    level: level as usize,
                    text: String::new(),
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(h) = current.as_mut() {
                    h.text.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(mut h) = current.take() {
                    h.text = h.text.trim().to_owned();
                    headings.push(h);
                }
            }
            _ => {}
        }
    }
    headings
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
Intro paragraph.

# Orders

Overview.

## Create

POST an order.

```sh
# not a heading
curl -X POST /orders
```

## Cancel `v2`

DELETE it.

# Billing

Invoices.
";

    fn summary(chunks: &[Chunk]) -> Vec<(String, i64)> {
        chunks
            .iter()
            .map(|c| {
                (
                    c.metadata.text(MetaKey::Heading).unwrap_or_default().to_owned(),
                    c.metadata.int(MetaKey::HeadingLevel).unwrap_or(-1),
                )
            })
            .collect()
    }

    #[test]
    fn sections_nest_and_preamble_is_level_zero() {
        let chunks = extract(DOC, "guide");
        assert_eq!(
            summary(&chunks),
            [
                ("guide".to_owned(), 0),
                ("Orders".to_owned(), 1),
                ("Create".to_owned(), 2),
                ("Cancel v2".to_owned(), 2),
                ("Billing".to_owned(), 1),
            ]
        );
        assert_eq!(chunks[0].content, "Intro paragraph.");
        assert!(chunks[1].content.contains("## Create"));
        assert!(chunks[1].content.contains("DELETE it."));
        assert!(!chunks[1].content.contains("# Billing"));
        assert!(chunks[2].content.contains("# not a heading"));
        assert!(!chunks[2].content.contains("Cancel"));
    }

    #[test]
    fn section_metadata() {
        let chunks = extract(DOC, "guide");
        let create = &chunks[2].metadata;
        assert_eq!(create.text(MetaKey::DocumentName), Some("guide"));
        assert_eq!(create.text(MetaKey::ChunkType), Some("documentation"));
        assert_eq!(create.int(MetaKey::LineStart), Some(7));
        assert_eq!(create.int(MetaKey::LineEnd), Some(14));
        assert_eq!(create.extra("section_index").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn no_preamble_without_leading_text() {
        let chunks = extract("# Only\n\ntext\n", "doc");
        assert_eq!(summary(&chunks), [("Only".to_owned(), 1)]);
        assert_eq!(chunks[0].metadata.int(MetaKey::LineEnd), Some(3));
    }

    #[test]
    fn document_without_headings_is_one_section() {
        let chunks = extract("just text\nmore\n", "notes");
        assert_eq!(summary(&chunks), [("notes".to_owned(), 0)]);
    }

    #[test]
    fn setext_headings_count() {
        let chunks = extract("Title\n=====\n\nbody\n\nSub\n---\n\nmore\n", "d");
        assert_eq!(
            summary(&chunks),
            [("Title".to_owned(), 1), ("Sub".to_owned(), 2)]
        );
    }
}
