//! Composition of the text that gets embedded.
//!
//! The header carries only semantically meaningful fields, in a fixed order. Ids,
//! line numbers and versions stay in the metadata. Changing the header layout changes
//! every embedding, so [`COMPOSER_VERSION`] must be bumped with it.

use serde::{Deserialize, Serialize};
use strata_memory::{MetaKey, Metadata};

use crate::chunk::Chunk;

/// Version of the header layout, stored as `composer_version` on every record.
pub const COMPOSER_VERSION: i64 = 1;

/// Header lines in the order they are rendered.
pub const HEADER_FIELDS: &[(MetaKey, &str)] = &[
    (MetaKey::ChunkType, "Type"),
    (MetaKey::Layer, "Layer"),
    (MetaKey::ClassName, "Class"),
    (MetaKey::MethodName, "Method"),
    (MetaKey::Package, "Package"),
    (MetaKey::Annotations, "Annotations"),
    (MetaKey::HttpMethod, "HTTP Method"),
    (MetaKey::ApiPath, "API Path"),
    (MetaKey::OperationId, "Operation"),
    (MetaKey::SchemaName, "Schema"),
    (MetaKey::DocumentName, "Document"),
    (MetaKey::Heading, "Heading"),
];

/// A chunk ready for embedding: the ingest file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedChunk {
    pub content: String,
    pub composed_text: String,
    pub metadata: Metadata,
}

impl ComposedChunk {
    #[must_use]
    pub fn chunk_id(&self) -> Option<&str> {
        self.metadata.chunk_id()
    }
}

/// Render the embedding input for `content` described by `metadata`.
///
/// Pure: equal inputs always produce byte-identical output.
#[must_use]
pub fn compose(content: &str, metadata: &Metadata) -> String {
    let mut out = String::new();
    for (key, label) in HEADER_FIELDS {
        let Some(value) = metadata.get(*key) else {
            continue;
        };
        let rendered = value.render();
        if rendered.is_empty() {
            continue;
        }
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&rendered);
        out.push('\n');
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(content);
    out
}

/// Compose `chunk` and stamp the composer version into its metadata.
#[must_use]
pub fn compose_chunk(chunk: Chunk) -> ComposedChunk {
    let Chunk {
        content,
        mut metadata,
    } = chunk;
    metadata.set(MetaKey::ComposerVersion, COMPOSER_VERSION);
    ComposedChunk {
        composed_text: compose(&content, &metadata),
        content,
        metadata,
    }
}

/// Recompose a stored record with the current header layout.
#[must_use]
pub fn recompose(record: ComposedChunk) -> ComposedChunk {
    compose_chunk(Chunk {
        content: record.content,
        metadata: record.metadata,
    })
}
