//! File kind detection and the tree-sitter grammar registry.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How a source file is chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Java,
    /// YAML or JSON; an `openapi`/`swagger` top-level key makes it an API document.
    Structured,
    Markdown,
    Gradle,
    /// Any other configured extension, kept as a single whole-file chunk.
    Generic,
}

impl FileKind {
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Structured => "structured",
            Self::Markdown => "markdown",
            Self::Gradle => "gradle",
            Self::Generic => "generic",
        }
    }

    /// Tree-sitter grammar for syntax-aware kinds. `None` when the kind has no grammar
    /// or the corresponding feature is disabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-java")]
            Self::Java => Some(tree_sitter_java::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// Detect the kind of `path`, or `None` if it is not indexable.
///
/// `extra_extensions` are matched case-insensitively, without the leading dot.
#[must_use]
pub fn detect_kind(path: &Path, extra_extensions: &[String]) -> Option<FileKind> {
    let name = path.file_name()?.to_str()?;
    if matches!(
        name,
        "build.gradle" | "build.gradle.kts" | "settings.gradle" | "settings.gradle.kts"
    ) {
        return Some(FileKind::Gradle);
    }

    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "java" => Some(FileKind::Java),
        "yaml" | "yml" | "json" => Some(FileKind::Structured),
        "md" | "markdown" => Some(FileKind::Markdown),
        other
            if extra_extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(other)) =>
        {
            Some(FileKind::Generic)
        }
        _ => None,
    }
}

/// Extension of `path` in lower case, or the file name when there is none.
#[must_use]
pub fn extension_label(path: &Path) -> String {
    path.extension()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}
