//! Typed chunk metadata and exact-match filters.
//!
//! Metadata is an ordered record: a closed set of known fields in canonical order,
//! followed by an `extra` bag for everything else. It serialises as one flat JSON
//! object so stored records and ingest files stay readable.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::VectorIndexError;

/// A primitive metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl MetaValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Human-readable rendering; lists are joined with `", "`.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(l) => l.join(", "),
        }
    }

    /// Rendered scalar values this field can be matched against.
    ///
    /// A scalar yields itself, a list yields each element.
    #[must_use]
    pub fn match_candidates(&self) -> Vec<String> {
        match self {
            Self::List(l) => l.clone(),
            other => vec![other.render()],
        }
    }

    /// Exact match against a filter value. Lists match when they contain the value.
    #[must_use]
    pub fn matches(&self, expected: &FieldValue) -> bool {
        match (self, expected) {
            (Self::Int(i), FieldValue::Integer(e)) => i == e,
            (_, FieldValue::Integer(_)) => false,
            (Self::List(l), FieldValue::Text(e)) => l.iter().any(|item| item == e),
            (other, FieldValue::Text(e)) => other.render() == *e,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<usize> for MetaValue {
    fn from(u: usize) -> Self {
        Self::Int(i64::try_from(u).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(l: Vec<String>) -> Self {
        Self::List(l)
    }
}

/// Shape a known field's value is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Int,
    List,
}

/// Known metadata fields, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    ChunkId,
    Module,
    FilePath,
    FileType,
    ChunkType,
    Layer,
    Package,
    ClassName,
    MethodName,
    Annotations,
    HttpMethod,
    ApiPath,
    OperationId,
    SchemaName,
    DocumentName,
    Heading,
    HeadingLevel,
    LineStart,
    LineEnd,
    ComposerVersion,
}

impl MetaKey {
    pub const ALL: [Self; 20] = [
        Self::ChunkId,
        Self::Module,
        Self::FilePath,
        Self::FileType,
        Self::ChunkType,
        Self::Layer,
        Self::Package,
        Self::ClassName,
        Self::MethodName,
        Self::Annotations,
        Self::HttpMethod,
        Self::ApiPath,
        Self::OperationId,
        Self::SchemaName,
        Self::DocumentName,
        Self::Heading,
        Self::HeadingLevel,
        Self::LineStart,
        Self::LineEnd,
        Self::ComposerVersion,
    ];

    /// Stable field name used in storage, filters and ingest files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChunkId => "chunk_id",
            Self::Module => "module",
            Self::FilePath => "file_path",
            Self::FileType => "file_type",
            Self::ChunkType => "type",
            Self::Layer => "layer",
            Self::Package => "package",
            Self::ClassName => "class_name",
            Self::MethodName => "method_name",
            Self::Annotations => "annotations",
            Self::HttpMethod => "http_method",
            Self::ApiPath => "api_path",
            Self::OperationId => "operation_id",
            Self::SchemaName => "schema_name",
            Self::DocumentName => "document_name",
            Self::Heading => "heading",
            Self::HeadingLevel => "heading_level",
            Self::LineStart => "line_start",
            Self::LineEnd => "line_end",
            Self::ComposerVersion => "composer_version",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    #[must_use]
    pub fn kind(self) -> ValueKind {
        match self {
            Self::HeadingLevel | Self::LineStart | Self::LineEnd | Self::ComposerVersion => {
                ValueKind::Int
            }
            Self::Annotations => ValueKind::List,
            _ => ValueKind::Text,
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered chunk metadata: known fields plus an extra bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, MetaValue>")]
pub struct Metadata {
    known: BTreeMap<MetaKey, MetaValue>,
    extra: BTreeMap<String, MetaValue>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: MetaKey, value: impl Into<MetaValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: MetaKey, value: impl Into<MetaValue>) {
        self.known.insert(key, value.into());
    }

    pub fn set_opt<V: Into<MetaValue>>(&mut self, key: MetaKey, value: Option<V>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn remove(&mut self, key: MetaKey) -> Option<MetaValue> {
        self.known.remove(&key)
    }

    #[must_use]
    pub fn get(&self, key: MetaKey) -> Option<&MetaValue> {
        self.known.get(&key)
    }

    #[must_use]
    pub fn text(&self, key: MetaKey) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_text)
    }

    #[must_use]
    pub fn int(&self, key: MetaKey) -> Option<i64> {
        self.get(key).and_then(MetaValue::as_int)
    }

    #[must_use]
    pub fn chunk_id(&self) -> Option<&str> {
        self.text(MetaKey::ChunkId)
    }

    /// Set a field by name. Names of known fields land in their typed slot.
    pub fn set_extra(&mut self, name: impl Into<String>, value: impl Into<MetaValue>) {
        let name = name.into();
        match MetaKey::parse(&name) {
            Some(key) => self.set(key, value),
            None => {
                self.extra.insert(name, value.into());
            }
        }
    }

    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.set_extra(name, value);
        self
    }

    #[must_use]
    pub fn extra(&self, name: &str) -> Option<&MetaValue> {
        self.extra.get(name)
    }

    /// Look a field up by name, known or extra.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&MetaValue> {
        match MetaKey::parse(name) {
            Some(key) => self.get(key),
            None => self.extra.get(name),
        }
    }

    /// All fields: known ones in canonical order, then extras by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.known
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len() + self.extra.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.extra.is_empty()
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl From<BTreeMap<String, MetaValue>> for Metadata {
    fn from(fields: BTreeMap<String, MetaValue>) -> Self {
        let mut meta = Self::new();
        for (name, value) in fields {
            meta.set_extra(name, value);
        }
        meta
    }
}

impl<K: Into<String>, V: Into<MetaValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut meta = Self::new();
        for (k, v) in iter {
            meta.set_extra(k, v);
        }
        meta
    }
}

/// Value side of an exact-match condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

/// Conjunction of exact-match field constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub must: Vec<FieldCondition>,
}

impl MetadataFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text condition on `field`.
    #[must_use]
    pub fn text_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(FieldCondition {
            field: field.into(),
            value: FieldValue::Text(value.into()),
        });
        self
    }

    /// Add an integer condition on `field`.
    #[must_use]
    pub fn int_eq(mut self, field: impl Into<String>, value: i64) -> Self {
        self.must.push(FieldCondition {
            field: field.into(),
            value: FieldValue::Integer(value),
        });
        self
    }

    /// Build a filter from string pairs, typing values of known integer fields.
    ///
    /// # Errors
    ///
    /// Returns [`VectorIndexError::InvalidFilter`] if a field name is empty or contains
    /// characters other than ASCII alphanumerics and `_`, or if an integer field gets a
    /// non-integer value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, VectorIndexError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut filter = Self::new();
        for (field, value) in pairs {
            let field = field.into();
            let value = value.into();
            validate_field_name(&field)?;
            let typed = match MetaKey::parse(&field).map(MetaKey::kind) {
                Some(ValueKind::Int) => FieldValue::Integer(value.parse().map_err(|_| {
                    VectorIndexError::InvalidFilter(format!(
                        "field `{field}` expects an integer, got `{value}`"
                    ))
                })?),
                _ => FieldValue::Text(value),
            };
            filter.must.push(FieldCondition {
                field,
                value: typed,
            });
        }
        Ok(filter)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.must.iter().map(|c| c.field.as_str())
    }

    /// Whether `metadata` satisfies every condition.
    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.must.iter().all(|cond| {
            metadata
                .field(&cond.field)
                .is_some_and(|v| v.matches(&cond.value))
        })
    }
}

/// Reject field names that cannot be safely embedded in a JSON path.
///
/// # Errors
///
/// Returns [`VectorIndexError::InvalidFilter`] for empty or non `[A-Za-z0-9_]` names.
pub fn validate_field_name(field: &str) -> Result<(), VectorIndexError> {
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(VectorIndexError::InvalidFilter(format!(
            "invalid field name `{field}`"
        )));
    }
    Ok(())
}
