//! Java declarations via tree-sitter.
//!
//! Top-level type declarations become one chunk each while they fit within the line
//! threshold. Larger ones are split into method and constructor chunks, and nested
//! types inside them follow the same rule.

use tree_sitter::{Node, Parser};

use strata_memory::{MetaKey, Metadata};

use crate::chunk::{Chunk, ChunkType, Layer};
use crate::error::{IndexError, Result};
use crate::languages::FileKind;

use super::layer_from_path;

const MEMBER_KINDS: &[&str] = &[
    "method_declaration",
    "constructor_declaration",
    "compact_constructor_declaration",
];

struct JavaCtx<'a> {
    source: &'a str,
    file_path: &'a str,
    package: Option<String>,
    imports: Vec<String>,
    max_lines: usize,
}

/// What a member inherits from its enclosing declaration.
struct Owner {
    class_name: String,
    layer: Layer,
    base_path: String,
}

/// An HTTP route declared by a Spring mapping annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    method: Option<String>,
    path: String,
}

/// Extract declaration chunks. `Ok(None)` means no grammar is available or the file
/// declares no types, and the caller should fall back to a whole-file chunk.
pub(super) fn extract(source: &str, file_path: &str, max_lines: usize) -> Result<Option<Vec<Chunk>>> {
    let Some(grammar) = FileKind::Java.grammar() else {
        return Ok(None);
    };

    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .map_err(|e| IndexError::Parse(format!("set_language failed: {e}")))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| IndexError::Parse(format!("parse failed for {file_path}")))?;

    let root = tree.root_node();
    if root.has_error() {
        tracing::debug!(file = %file_path, "java source has syntax errors");
    }

    let ctx = JavaCtx {
        source,
        file_path,
        package: extract_package(&root, source),
        imports: extract_imports(&root, source),
        max_lines,
    };

    let mut chunks = Vec::new();
    for node in named_children(&root) {
        if declaration_type(node.kind()).is_some() {
            chunk_declaration(&ctx, &node, None, &mut chunks);
        }
    }

    if chunks.is_empty() {
        return Ok(None);
    }
    Ok(Some(chunks))
}

/// Layer implied by Spring stereotype annotations, if any.
#[must_use]
pub fn layer_from_annotations(annotations: &[String]) -> Option<Layer> {
    annotations.iter().find_map(|a| match simple_name(a) {
        "RestController" | "Controller" => Some(Layer::Controller),
        "Service" => Some(Layer::Service),
        "Repository" => Some(Layer::Repository),
        "Configuration" | "SpringBootApplication" => Some(Layer::Config),
        "ControllerAdvice" | "RestControllerAdvice" => Some(Layer::Exception),
        "Entity" | "Table" | "Embeddable" => Some(Layer::Model),
        _ => None,
    })
}

fn chunk_declaration(ctx: &JavaCtx<'_>, node: &Node<'_>, owner: Option<&Owner>, out: &mut Vec<Chunk>) {
    let Some(chunk_type) = declaration_type(node.kind()) else {
        return;
    };
    let name = field_text(node, "name", ctx.source).unwrap_or_else(|| "unknown".to_owned());
    let modifiers = find_child(node, "modifiers");
    let annotations = modifiers
        .as_ref()
        .map(|m| annotation_texts(m, ctx.source))
        .unwrap_or_default();

    let layer = layer_from_annotations(&annotations)
        .or_else(|| owner.map(|o| o.layer))
        .unwrap_or_else(|| layer_from_path(ctx.file_path));
    let class_route = modifiers
        .as_ref()
        .and_then(|m| mapping_route(m, ctx.source));
    let base_path = join_paths(
        owner.map_or("", |o| o.base_path.as_str()),
        class_route.as_ref().map_or("", |r| r.path.as_str()),
    );

    let members = body_members(node);
    let fits = line_span(node) <= ctx.max_lines;

    if fits || members.is_empty() {
        let mut metadata = base_metadata(ctx, node, chunk_type, layer, &name, annotations);
        if class_route.is_some() {
            metadata.set(MetaKey::ApiPath, normalize_path(&base_path));
        }
        if let Some(method) = class_route.and_then(|r| r.method) {
            metadata.set(MetaKey::HttpMethod, method);
        }
        let endpoints: Vec<String> = members
            .iter()
            .filter_map(|m| {
                let modifiers = find_child(m, "modifiers")?;
                let route = mapping_route(&modifiers, ctx.source)?;
                let path = normalize_path(&join_paths(&base_path, &route.path));
                Some(format!("{} {path}", route.method.as_deref().unwrap_or("ANY")))
            })
            .collect();
        if !endpoints.is_empty() {
            metadata.set_extra("is_rest_endpoint", true);
            metadata.set_extra("endpoints", endpoints);
        }
        out.push(Chunk {
            content: ctx.source[node.byte_range()].to_owned(),
            metadata,
        });
        return;
    }

    let owner = Owner {
        class_name: name,
        layer,
        base_path,
    };
    for member in &members {
        if declaration_type(member.kind()).is_some() {
            chunk_declaration(ctx, member, Some(&owner), out);
        } else {
            out.push(member_chunk(ctx, member, &owner));
        }
    }
}

fn member_chunk(ctx: &JavaCtx<'_>, node: &Node<'_>, owner: &Owner) -> Chunk {
    let chunk_type = if node.kind() == "method_declaration" {
        ChunkType::Method
    } else {
        ChunkType::Constructor
    };
    let modifiers = find_child(node, "modifiers");
    let annotations = modifiers
        .as_ref()
        .map(|m| annotation_texts(m, ctx.source))
        .unwrap_or_default();
    let route = modifiers
        .as_ref()
        .and_then(|m| mapping_route(m, ctx.source));

    let mut metadata = base_metadata(ctx, node, chunk_type, owner.layer, &owner.class_name, annotations);
    let method_name = field_text(node, "name", ctx.source).unwrap_or_else(|| owner.class_name.clone());
    metadata.set(MetaKey::MethodName, method_name);
    if let Some(route) = route {
        metadata.set(
            MetaKey::ApiPath,
            normalize_path(&join_paths(&owner.base_path, &route.path)),
        );
        metadata.set_opt(MetaKey::HttpMethod, route.method);
        metadata.set_extra("is_rest_endpoint", true);
    }

    Chunk {
        content: ctx.source[node.byte_range()].to_owned(),
        metadata,
    }
}

fn base_metadata(
    ctx: &JavaCtx<'_>,
    node: &Node<'_>,
    chunk_type: ChunkType,
    layer: Layer,
    class_name: &str,
    annotations: Vec<String>,
) -> Metadata {
    let mut metadata = Metadata::new()
        .with(MetaKey::ChunkType, chunk_type.as_str())
        .with(MetaKey::Layer, layer.as_str())
        .with(MetaKey::ClassName, class_name)
        .with(MetaKey::LineStart, node.start_position().row + 1)
        .with(MetaKey::LineEnd, node.end_position().row + 1);
    metadata.set_opt(MetaKey::Package, ctx.package.clone());
    if !annotations.is_empty() {
        metadata.set(MetaKey::Annotations, annotations);
    }
    if !ctx.imports.is_empty() {
        metadata.set_extra("imports", ctx.imports.clone());
    }
    metadata
}

fn declaration_type(kind: &str) -> Option<ChunkType> {
    match kind {
        "class_declaration" => Some(ChunkType::Class),
        "interface_declaration" => Some(ChunkType::Interface),
        "enum_declaration" => Some(ChunkType::Enum),
        "record_declaration" => Some(ChunkType::Record),
        "annotation_type_declaration" => Some(ChunkType::Annotation),
        _ => None,
    }
}

/// Methods, constructors and nested types of a declaration body, in source order.
fn body_members<'t>(node: &Node<'t>) -> Vec<Node<'t>> {
    let Some(body) = node.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut members = Vec::new();
    for child in named_children(&body) {
        if child.kind() == "enum_body_declarations" {
            members.extend(named_children(&child).filter(is_member));
        } else if is_member(&child) {
            members.push(child);
        }
    }
    members
}

fn is_member(node: &Node<'_>) -> bool {
    MEMBER_KINDS.contains(&node.kind()) || declaration_type(node.kind()).is_some()
}

fn line_span(node: &Node<'_>) -> usize {
    node.end_position().row - node.start_position().row + 1
}

fn extract_package(root: &Node<'_>, source: &str) -> Option<String> {
    let decl = find_child(root, "package_declaration")?;
    named_children(&decl)
        .find(|n| matches!(n.kind(), "scoped_identifier" | "identifier"))
        .map(|n| source[n.byte_range()].to_owned())
}

fn extract_imports(root: &Node<'_>, source: &str) -> Vec<String> {
    named_children(root)
        .filter(|n| n.kind() == "import_declaration")
        .map(|n| {
            source[n.byte_range()]
                .trim()
                .trim_start_matches("import")
                .trim_end_matches(';')
                .trim()
                .to_owned()
        })
        .collect()
}

/// Annotation texts of a `modifiers` node in source order, whitespace collapsed.
fn annotation_texts(modifiers: &Node<'_>, source: &str) -> Vec<String> {
    named_children(modifiers)
        .filter(|n| matches!(n.kind(), "marker_annotation" | "annotation"))
        .map(|n| source[n.byte_range()].split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

/// The route of the first Spring mapping annotation among `modifiers`.
fn mapping_route(modifiers: &Node<'_>, source: &str) -> Option<Route> {
    named_children(modifiers)
        .filter(|n| matches!(n.kind(), "marker_annotation" | "annotation"))
        .find_map(|annotation| {
            let name = field_text(&annotation, "name", source)?;
            let fixed = match simple_name(&name) {
                "GetMapping" => Some("GET"),
                "PostMapping" => Some("POST"),
                "PutMapping" => Some("PUT"),
                "DeleteMapping" => Some("DELETE"),
                "PatchMapping" => Some("PATCH"),
                "RequestMapping" => None,
                _ => return None,
            };
            let mut route = Route {
                method: fixed.map(str::to_owned),
                path: String::new(),
            };
            let Some(args) = annotation.child_by_field_name("arguments") else {
                return Some(route);
            };
            for arg in named_children(&args) {
                if arg.kind() == "element_value_pair" {
                    let key = field_text(&arg, "key", source).unwrap_or_default();
                    let Some(value) = arg.child_by_field_name("value") else {
                        continue;
                    };
                    match key.as_str() {
                        "value" | "path" => {
                            route.path = first_string(&value, source).unwrap_or_default();
                        }
                        "method" if route.method.is_none() => {
                            route.method = first_request_method(&value, source);
                        }
                        _ => {}
                    }
                } else if let Some(path) = first_string(&arg, source) {
                    route.path = path;
                }
            }
            Some(route)
        })
}

/// First string literal in `node` or, for an array initializer, its first element.
fn first_string(node: &Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "string_literal" => Some(source[node.byte_range()].trim_matches('"').to_owned()),
        "element_value_array_initializer" => {
            named_children(node).find_map(|n| first_string(&n, source))
        }
        _ => None,
    }
}

fn first_request_method(node: &Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "element_value_array_initializer" => {
            named_children(node).find_map(|n| first_request_method(&n, source))
        }
        "field_access" | "identifier" => {
            Some(simple_name(&source[node.byte_range()]).to_ascii_uppercase())
        }
        _ => None,
    }
}

fn join_paths(base: &str, sub: &str) -> String {
    let base = base.trim_end_matches('/');
    let sub = sub.trim_start_matches('/');
    match (base.is_empty(), sub.is_empty()) {
        (true, true) => String::new(),
        (false, true) => base.to_owned(),
        (true, false) => sub.to_owned(),
        (false, false) => format!("{base}/{sub}"),
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

/// Last dotted segment of an annotation or qualified name, without `@` or arguments.
fn simple_name(text: &str) -> &str {
    let text = text.trim_start_matches('@');
    let text = text.split('(').next().unwrap_or(text).trim();
    text.rsplit('.').next().unwrap_or(text)
}

fn field_text(node: &Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| source[n.byte_range()].to_owned())
}

fn find_child<'t>(node: &Node<'t>, kind: &str) -> Option<Node<'t>> {
    named_children(node).find(|n| n.kind() == kind)
}

fn named_children<'t>(node: &Node<'t>) -> impl Iterator<Item = Node<'t>> {
    let node = *node;
    let count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    (0..count).filter_map(move |i| node.named_child(i))
}
