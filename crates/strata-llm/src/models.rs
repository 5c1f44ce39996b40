//! Output dimensions of well-known embedding models.

const KNOWN_DIMENSIONS: &[(&str, usize)] = &[
    ("amazon.titan-embed-text-v2:0", 1024),
    ("amazon.titan-embed-text-v1", 1536),
    ("text-embedding-3-small", 1536),
    ("text-embedding-3-large", 3072),
    ("text-embedding-ada-002", 1536),
    ("nomic-embed-text", 768),
    ("mxbai-embed-large", 1024),
];

/// Native vector length for `model`, if it is a model we know.
///
/// Ollama tags (`nomic-embed-text:latest`) resolve to their base model.
#[must_use]
pub fn known_dimension(model: &str) -> Option<usize> {
    let lookup = |name: &str| {
        KNOWN_DIMENSIONS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, dim)| *dim)
    };
    lookup(model).or_else(|| model.split_once(':').and_then(|(base, _)| lookup(base)))
}
