//! Gradle build scripts: the whole file plus its dependency and plugin blocks.

use std::sync::LazyLock;

use regex::Regex;
use strata_memory::{MetaKey, Metadata};

use crate::chunk::{Chunk, ChunkType, Layer};

use super::line_of;

static JAVA_VERSION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"sourceCompatibility\s*=\s*['"]?(?:JavaVersion\.VERSION_)?(\d+(?:\.\d+)?)"#,
        r"JavaVersion\.VERSION_(\d+)",
        r"JavaLanguageVersion\.of\(\s*(\d+)\s*\)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SPRING_BOOT_VERSION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"['"]org\.springframework\.boot['"]\s*\)?\s*version\s*\(?\s*['"]([^'"]+)['"]"#,
        r#"spring-boot-gradle-plugin:([^'"\s)]+)"#,
        r#"springBootVersion\s*=\s*['"]([^'"]+)['"]"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([\w.\-]+:[\w.\-]+(?::[\w.\-${}]+)?)['"]"#).unwrap());

static PLUGIN_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"id\s*\(?\s*['"]([^'"]+)['"]"#).unwrap());

static BARE_PLUGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*`?([A-Za-z][\w\-]*)`?\s*$").unwrap());

/// A top-level `name { ... }` block, as byte offsets including the braces.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    name: String,
    start: usize,
    end: usize,
}

pub(super) fn extract(source: &str) -> Vec<Chunk> {
    let mut full = Metadata::new()
        .with(MetaKey::ChunkType, ChunkType::BuildConfigFull.as_str())
        .with(MetaKey::Layer, Layer::Build.as_str())
        .with(MetaKey::LineStart, 1_i64)
        .with(MetaKey::LineEnd, source.lines().count().max(1));
    if let Some(v) = first_capture(&JAVA_VERSION, source) {
        full.set_extra("java_version", v);
    }
    if let Some(v) = first_capture(&SPRING_BOOT_VERSION, source) {
        full.set_extra("spring_boot_version", v);
    }

    let mut chunks = vec![Chunk {
        content: source.to_owned(),
        metadata: full,
    }];

    for block in top_level_blocks(source) {
        let text = &source[block.start..block.end];
        let (chunk_type, key, items) = match block.name.as_str() {
            "dependencies" => (ChunkType::BuildDependencies, "dependency_list", dependency_list(text)),
            "plugins" => (ChunkType::BuildPlugins, "plugin_list", plugin_list(text)),
            _ => continue,
        };
        let line_start = line_of(source, block.start);
        let mut metadata = Metadata::new()
            .with(MetaKey::ChunkType, chunk_type.as_str())
            .with(MetaKey::Layer, Layer::Build.as_str())
            .with(MetaKey::LineStart, line_start)
            .with(MetaKey::LineEnd, line_of(source, block.end.saturating_sub(1)));
        if !items.is_empty() {
            metadata.set_extra(key, items);
        }
        chunks.push(Chunk {
            content: text.to_owned(),
            metadata,
        });
    }
    chunks
}

fn first_capture(patterns: &[Regex], source: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(source))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

fn dependency_list(block: &str) -> Vec<String> {
    DEPENDENCY
        .captures_iter(block)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .collect()
}

fn plugin_list(block: &str) -> Vec<String> {
    let inner = block
        .find('{')
        .zip(block.rfind('}'))
        .map_or(block, |(open, close)| &block[open + 1..close]);
    let mut plugins: Vec<String> = Vec::new();
    for line in inner.lines() {
        if let Some(c) = PLUGIN_ID.captures(line) {
            plugins.push(c[1].to_owned());
        } else if let Some(c) = BARE_PLUGIN.captures(line) {
            plugins.push(c[1].to_owned());
        }
    }
    plugins
}

/// Top-level blocks of a Groovy or Kotlin build script.
///
/// Braces inside string literals and comments are ignored.
fn top_level_blocks(source: &str) -> Vec<Block> {
    let bytes = source.as_bytes();
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut last_ident: Option<(usize, usize)> = None;
    let mut open: Option<(String, usize)> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = find_from(bytes, i, b"\n").unwrap_or(bytes.len());
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_from(bytes, i + 2, b"*/").map_or(bytes.len(), |end| end + 2);
                continue;
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                last_ident = None;
                continue;
            }
            b'{' => {
                if depth == 0
                    && let Some((s, e)) = last_ident.take()
                {
                    open = Some((source[s..e].to_owned(), s));
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0
                    && let Some((name, start)) = open.take()
                {
                    blocks.push(Block {
                        name,
                        start,
                        end: i + 1,
                    });
                }
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                if depth == 0 {
                    last_ident = Some((start, i));
                }
                continue;
            }
            b if b.is_ascii_whitespace() => {}
            _ => last_ident = None,
        }
        i += 1;
    }
    blocks
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Index just past the string literal starting at `start`, honouring escapes and
/// triple-quoted strings.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let triple = [quote; 3];
    if bytes.get(start..start + 3) == Some(&triple[..]) {
        return find_from(bytes, start + 3, &triple).map_or(bytes.len(), |end| end + 3);
    }
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}
