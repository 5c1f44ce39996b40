//! Coverage check of an ingest file against the source tree it came from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use strata_memory::MetaKey;

use crate::composer::ComposedChunk;
use crate::error::Result;
use crate::extractor::{ExtractConfig, discover_modules, indexable_files, relative_path};

/// Outcome of [`verify_coverage`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    /// Indexable files in the tree.
    pub source_files: usize,
    /// Distinct files referenced by the records.
    pub chunked_files: usize,
    /// Source files with content but no record.
    pub missing: Vec<String>,
    /// Whitespace-only source files, which never produce records.
    pub empty: Vec<String>,
    /// Files referenced by records that are not in the tree.
    pub extra: Vec<String>,
    /// Per file, the number of records of each chunk type.
    pub chunk_types: BTreeMap<String, BTreeMap<String, usize>>,
}

impl CoverageReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Compare the indexable files under `root` with the files present in `records`.
///
/// # Errors
///
/// Returns an error if the modules under `root` cannot be resolved.
pub async fn verify_coverage(
    root: &Path,
    records: &[ComposedChunk],
    config: &ExtractConfig,
) -> Result<CoverageReport> {
    let mut report = CoverageReport::default();
    for record in records {
        let file = record
            .metadata
            .text(MetaKey::FilePath)
            .unwrap_or("<unknown>")
            .to_owned();
        let chunk_type = record
            .metadata
            .text(MetaKey::ChunkType)
            .unwrap_or("unknown")
            .to_owned();
        *report
            .chunk_types
            .entry(file)
            .or_default()
            .entry(chunk_type)
            .or_default() += 1;
    }
    report.chunked_files = report.chunk_types.len();

    let mut sources = BTreeSet::new();
    for module in discover_modules(root, config.module_pattern.as_deref())? {
        for (path, _) in indexable_files(&module.path, &config.extra_extensions) {
            let rel = relative_path(root, &path);
            if !report.chunk_types.contains_key(&rel) {
                let blank = tokio::fs::read_to_string(&path)
                    .await
                    .is_ok_and(|s| s.trim().is_empty());
                if blank {
                    report.empty.push(rel.clone());
                } else {
                    report.missing.push(rel.clone());
                }
            }
            sources.insert(rel);
        }
    }
    report.source_files = sources.len();
    report.extra = report
        .chunk_types
        .keys()
        .filter(|f| !sources.contains(*f))
        .cloned()
        .collect();

    tracing::info!(
        source_files = report.source_files,
        chunked_files = report.chunked_files,
        missing = report.missing.len(),
        extra = report.extra.len(),
        "coverage verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use strata_memory::Metadata;

    use super::*;
    use crate::chunk::Chunk;
    use crate::composer::compose_chunk;
    use crate::extractor::extract_tree;

    fn record(file: &str, chunk_type: &str) -> ComposedChunk {
        compose_chunk(Chunk {
            content: String::new(),
            metadata: Metadata::new()
                .with(MetaKey::FilePath, file)
                .with(MetaKey::ChunkType, chunk_type),
        })
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/guide.md"), "# Guide\n\n## Setup\ntext\n").unwrap();
        fs::write(dir.path().join("app.properties"), "port=8080\n").unwrap();
        fs::write(dir.path().join("blank.sql"), "  \n").unwrap();
        fs::write(dir.path().join("notes.txt"), "not indexable").unwrap();
        dir
    }

    #[tokio::test]
    async fn extraction_output_covers_the_tree() {
        let dir = tree();
        let config = ExtractConfig::default();
        let extraction = extract_tree(dir.path(), &config).await.unwrap();
        let records: Vec<_> = extraction.chunks.into_iter().map(compose_chunk).collect();

        let report = verify_coverage(dir.path(), &records, &config).await.unwrap();
        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.source_files, 3);
        assert_eq!(report.chunked_files, 2);
        assert_eq!(report.empty, ["blank.sql"]);
        assert_eq!(report.chunk_types["docs/guide.md"]["documentation"], 2);
        assert_eq!(report.chunk_types["app.properties"]["file"], 1);
    }

    #[tokio::test]
    async fn reports_missing_and_extra_files() {
        let dir = tree();
        let records = vec![
            record("docs/guide.md", "documentation"),
            record("src/Gone.java", "class"),
        ];
        let report = verify_coverage(dir.path(), &records, &ExtractConfig::default())
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.missing, ["app.properties"]);
        assert_eq!(report.extra, ["src/Gone.java"]);
    }
}
