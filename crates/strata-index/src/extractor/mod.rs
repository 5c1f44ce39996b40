//! Syntax-aware chunk extraction over a source tree.
//!
//! Each file is routed by [`FileKind`] to a dedicated extractor. The extractor fills
//! the kind-specific metadata; [`extract_file`] then stamps the common fields
//! (`chunk_id`, `module`, `file_path`, `file_type`) in emission order.

mod gradle;
mod java;
mod markdown;
mod openapi;

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use strata_memory::{MetaKey, Metadata};

use crate::chunk::{Chunk, ChunkType, Layer, chunk_id};
use crate::error::{IndexError, Result};
use crate::languages::{FileKind, detect_kind, extension_label};

pub use java::layer_from_annotations;

/// Extraction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Glob selecting module directories directly under the root. `None` treats the
    /// root itself as the only module.
    pub module_pattern: Option<String>,
    /// Declarations longer than this are split into member chunks (default: 300).
    pub max_declaration_lines: usize,
    /// Extensions emitted as whole-file chunks, without the leading dot.
    pub extra_extensions: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            module_pattern: None,
            max_declaration_lines: 300,
            extra_extensions: vec!["properties".into(), "sql".into(), "xml".into()],
        }
    }
}

/// A module: a named directory whose files share the `module` metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModule {
    pub name: String,
    pub path: PathBuf,
}

/// A file that could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file_path: String,
    pub error: String,
}

/// Summary of an extraction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub modules: Vec<String>,
    pub files_scanned: usize,
    pub files_chunked: usize,
    pub chunks: usize,
    pub errors: Vec<FileError>,
    pub duration_ms: u64,
}

/// Chunks of a whole tree plus the run summary.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub chunks: Vec<Chunk>,
    pub report: ExtractionReport,
}

/// Resolve the modules under `root`.
///
/// With a pattern, every direct sub-directory whose name matches it is a module,
/// sorted by name. Without one, `root` is a single module named after its directory.
///
/// # Errors
///
/// Returns an error if the pattern is invalid or `root` cannot be listed.
pub fn discover_modules(root: &Path, pattern: Option<&str>) -> Result<Vec<SourceModule>> {
    let Some(pattern) = pattern else {
        let name = root
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "root".to_owned());
        return Ok(vec![SourceModule {
            name,
            path: root.to_path_buf(),
        }]);
    };

    let pattern = glob::Pattern::new(pattern)?;
    let mut modules = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.matches(&name) {
            modules.push(SourceModule {
                name,
                path: entry.path(),
            });
        }
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(modules)
}

/// Indexable files of `dir`, sorted, honouring `.gitignore` and skipping hidden files.
#[must_use]
pub fn indexable_files(dir: &Path, extra_extensions: &[String]) -> Vec<(PathBuf, FileKind)> {
    let mut files: Vec<_> = ignore::WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(true)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|e| {
            let kind = detect_kind(e.path(), extra_extensions)?;
            Some((e.into_path(), kind))
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

/// `path` relative to `root` with `/` separators.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract every module under `root`.
///
/// A file that cannot be read or parsed is recorded in the report and skipped.
///
/// # Errors
///
/// Returns an error only if the modules themselves cannot be resolved.
pub async fn extract_tree(root: &Path, config: &ExtractConfig) -> Result<Extraction> {
    let start = Instant::now();
    let modules = discover_modules(root, config.module_pattern.as_deref())?;
    let mut extraction = Extraction::default();

    for module in &modules {
        extraction.report.modules.push(module.name.clone());
        let files = indexable_files(&module.path, &config.extra_extensions);
        tracing::info!(module = %module.name, files = files.len(), "extracting module");

        for (path, kind) in files {
            extraction.report.files_scanned += 1;
            let rel_path = relative_path(root, &path);
            let outcome = match tokio::fs::read_to_string(&path).await {
                Ok(source) => extract_file(&module.name, &rel_path, &source, kind, config),
                Err(e) => Err(IndexError::Io(e)),
            };
            match outcome {
                Ok(chunks) => {
                    if !chunks.is_empty() {
                        extraction.report.files_chunked += 1;
                    }
                    tracing::debug!(file = %rel_path, kind = kind.id(), chunks = chunks.len());
                    extraction.report.chunks += chunks.len();
                    extraction.chunks.extend(chunks);
                }
                Err(e) => {
                    tracing::warn!(file = %rel_path, error = %e, "skipping file");
                    extraction.report.errors.push(FileError {
                        file_path: rel_path,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    extraction.report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    tracing::info!(
        modules = extraction.report.modules.len(),
        files = extraction.report.files_scanned,
        chunks = extraction.report.chunks,
        errors = extraction.report.errors.len(),
        "extraction complete"
    );
    Ok(extraction)
}

/// Extract the chunks of one file.
///
/// Empty or whitespace-only sources yield no chunks. Chunk ids are derived from
/// `(module, file_path, ordinal)`, so unchanged input always reproduces them.
///
/// # Errors
///
/// Returns [`IndexError::Parse`] (or a decoding error) if the file cannot be parsed.
pub fn extract_file(
    module: &str,
    file_path: &str,
    source: &str,
    kind: FileKind,
    config: &ExtractConfig,
) -> Result<Vec<Chunk>> {
    if source.trim().is_empty() {
        return Ok(Vec::new());
    }

    let (file_type, chunks) = match kind {
        FileKind::Java => {
            let chunks = java::extract(source, file_path, config.max_declaration_lines)?
                .unwrap_or_else(|| vec![whole_file(source, file_path)]);
            ("java".to_owned(), chunks)
        }
        FileKind::Structured => match openapi::parse_api_document(source) {
            Some(doc) => ("openapi".to_owned(), openapi::extract(&doc)?),
            None => (
                extension_label(Path::new(file_path)),
                vec![whole_file(source, file_path)],
            ),
        },
        FileKind::Markdown => (
            "markdown".to_owned(),
            markdown::extract(source, &document_name(file_path)),
        ),
        FileKind::Gradle => ("gradle".to_owned(), gradle::extract(source)),
        FileKind::Generic => (
            extension_label(Path::new(file_path)),
            vec![whole_file(source, file_path)],
        ),
    };

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, mut chunk)| {
            let meta = &mut chunk.metadata;
            meta.set(MetaKey::ChunkId, chunk_id(module, file_path, ordinal));
            meta.set(MetaKey::Module, module);
            meta.set(MetaKey::FilePath, file_path);
            meta.set(MetaKey::FileType, file_type.as_str());
            chunk
        })
        .collect())
}

/// Architectural layer implied by the directory segments of `file_path`.
#[must_use]
pub fn layer_from_path(file_path: &str) -> Layer {
    let segments: Vec<String> = file_path
        .split('/')
        .rev()
        .skip(1)
        .map(str::to_ascii_lowercase)
        .collect();
    let has = |names: &[&str]| segments.iter().any(|s| names.contains(&s.as_str()));

    if has(&["controller", "controllers"]) {
        Layer::Controller
    } else if has(&["service", "services"]) {
        Layer::Service
    } else if has(&["config", "configuration"]) {
        Layer::Config
    } else if has(&["exception", "exceptions"]) {
        Layer::Exception
    } else if has(&["model", "models", "entity", "entities", "domain"]) {
        Layer::Model
    } else if has(&["repository", "repositories"]) {
        Layer::Repository
    } else if has(&["dto", "dtos"]) {
        Layer::Dto
    } else {
        Layer::Other
    }
}

fn document_name(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_owned())
}

fn whole_file(source: &str, file_path: &str) -> Chunk {
    let metadata = Metadata::new()
        .with(MetaKey::ChunkType, ChunkType::File.as_str())
        .with(MetaKey::Layer, layer_from_path(file_path).as_str())
        .with(MetaKey::LineStart, 1_i64)
        .with(MetaKey::LineEnd, source.lines().count().max(1))
        .with_extra("extension", extension_label(Path::new(file_path)));
    Chunk {
        content: source.to_owned(),
        metadata,
    }
}

/// 1-based line of byte `offset` in `source`.
pub(crate) fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtractConfig {
        ExtractConfig::default()
    }

    #[test]
    fn layer_from_path_uses_directories_only() {
        assert_eq!(
            layer_from_path("svc/src/main/java/com/acme/controller/OrderApi.java"),
            Layer::Controller
        );
        assert_eq!(layer_from_path("svc/entity/Order.java"), Layer::Model);
        assert_eq!(layer_from_path("svc/dto/OrderDto.java"), Layer::Dto);
        assert_eq!(layer_from_path("svc/Service.java"), Layer::Other);
        assert_eq!(layer_from_path("Main.java"), Layer::Other);
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/tmp/repo");
        assert_eq!(
            relative_path(root, &root.join("svc").join("A.java")),
            "svc/A.java"
        );
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let chunks = extract_file("m", "a.properties", "  \n\t\n", FileKind::Generic, &config())
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn generic_file_is_one_chunk_with_common_fields() {
        let chunks = extract_file(
            "orders",
            "orders/config/application.properties",
            "server.port=8080\nspring.application.name=orders\n",
            FileKind::Generic,
            &config(),
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        let meta = &chunks[0].metadata;
        assert_eq!(meta.text(MetaKey::ChunkType), Some("file"));
        assert_eq!(meta.text(MetaKey::FileType), Some("properties"));
        assert_eq!(meta.text(MetaKey::Layer), Some("config"));
        assert_eq!(meta.text(MetaKey::Module), Some("orders"));
        assert_eq!(meta.int(MetaKey::LineEnd), Some(2));
        assert_eq!(
            meta.chunk_id(),
            Some(chunk_id("orders", "orders/config/application.properties", 0).as_str())
        );
    }

    #[test]
    fn plain_yaml_is_a_generic_chunk() {
        let chunks = extract_file(
            "m",
            "deploy/values.yaml",
            "replicas: 2\nimage: app\n",
            FileKind::Structured,
            &config(),
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.text(MetaKey::FileType), Some("yaml"));
        assert_eq!(chunks[0].metadata.text(MetaKey::ChunkType), Some("file"));
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let src = "# Title\n\nintro\n\n## A\n\ntext\n";
        let first = extract_file("m", "docs/x.md", src, FileKind::Markdown, &config()).unwrap();
        let second = extract_file("m", "docs/x.md", src, FileKind::Markdown, &config()).unwrap();
        let ids = |c: &[Chunk]| {
            c.iter()
                .map(|c| c.metadata.chunk_id().unwrap_or_default().to_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn line_of_counts_newlines() {
        let src = "a\nb\nc";
        assert_eq!(line_of(src, 0), 1);
        assert_eq!(line_of(src, 2), 2);
        assert_eq!(line_of(src, 100), 3);
    }

    #[test]
    fn discover_modules_matches_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("orders-service")).unwrap();
        std::fs::create_dir(dir.path().join("billing-service")).unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("x-service"), "file, not dir").unwrap();

        let modules = discover_modules(dir.path(), Some("*-service")).unwrap();
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["billing-service", "orders-service"]);

        let single = discover_modules(dir.path(), None).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].path, dir.path());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_modules(dir.path(), Some("[")),
            Err(IndexError::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn extract_tree_reports_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let svc = dir.path().join("orders-service");
        std::fs::create_dir_all(svc.join("docs")).unwrap();
        std::fs::write(svc.join("docs/guide.md"), "# Guide\n\nhello\n").unwrap();
        std::fs::write(svc.join("app.properties"), "a=b\n").unwrap();
        std::fs::write(svc.join("empty.md"), "").unwrap();
        std::fs::write(svc.join("broken.md"), [0xff_u8, 0xfe, 0x00]).unwrap();
        std::fs::write(svc.join("ignored.txt"), "not indexable").unwrap();

        let config = ExtractConfig {
            module_pattern: Some("*-service".into()),
            ..ExtractConfig::default()
        };
        let extraction = extract_tree(dir.path(), &config).await.unwrap();
        let report = &extraction.report;

        assert_eq!(report.modules, ["orders-service"]);
        assert_eq!(report.files_scanned, 4);
        assert_eq!(report.files_chunked, 2);
        assert_eq!(report.chunks, extraction.chunks.len());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file_path, "orders-service/broken.md");
        assert!(
            extraction
                .chunks
                .iter()
                .all(|c| c.metadata.text(MetaKey::Module) == Some("orders-service"))
        );
        assert!(
            extraction
                .chunks
                .iter()
                .any(|c| c.metadata.text(MetaKey::FilePath) == Some("orders-service/docs/guide.md"))
        );
    }
}
