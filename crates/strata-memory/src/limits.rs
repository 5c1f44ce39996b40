//! Filterable/non-filterable metadata split for backends with metadata ceilings.

use std::collections::BTreeSet;

use crate::error::VectorIndexError;
use crate::metadata::{MetaKey, MetaValue, Metadata, MetadataFilter};

/// Top-level key holding the raw chunk text on limited backends.
pub const CONTENT_KEY: &str = "content";
/// Top-level key holding the non-filterable fields as one JSON object.
pub const ATTRIBUTES_KEY: &str = "attributes";

/// Per-record ceilings imposed by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLimits {
    /// Maximum top-level keys per stored record, `content` and `attributes` included.
    pub max_keys: usize,
    /// Maximum size of the filterable portion, measured as compact JSON.
    pub max_filterable_bytes: usize,
}

impl Default for MetadataLimits {
    fn default() -> Self {
        Self {
            max_keys: 10,
            max_filterable_bytes: 2048,
        }
    }
}

/// Which metadata fields a backend can use in a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterableFields {
    All,
    Only(BTreeSet<String>),
}

impl FilterableFields {
    /// Restrict filtering to `fields`; `chunk_id` is always added.
    #[must_use]
    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: BTreeSet<String> = fields.into_iter().map(Into::into).collect();
        set.insert(MetaKey::ChunkId.as_str().to_owned());
        Self::Only(set)
    }

    /// Default filterable set for limited backends: small identifying fields only.
    #[must_use]
    pub fn essential() -> Self {
        Self::only(
            [
                MetaKey::ChunkId,
                MetaKey::Module,
                MetaKey::FilePath,
                MetaKey::FileType,
                MetaKey::ChunkType,
                MetaKey::Layer,
                MetaKey::ClassName,
                MetaKey::Package,
            ]
            .map(MetaKey::as_str),
        )
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(field),
        }
    }
}

/// What a backend can store and filter on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub filterable: FilterableFields,
    pub limits: Option<MetadataLimits>,
}

impl Capabilities {
    /// No ceilings, every field filterable.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            filterable: FilterableFields::All,
            limits: None,
        }
    }

    /// Ensure every field named in `filter` is filterable here.
    ///
    /// # Errors
    ///
    /// Returns [`VectorIndexError::NonFilterableField`] for the first offending field.
    pub fn check_filter(&self, filter: &MetadataFilter) -> Result<(), VectorIndexError> {
        match filter.fields().find(|f| !self.filterable.contains(f)) {
            Some(field) => Err(VectorIndexError::NonFilterableField(field.to_owned())),
            None => Ok(()),
        }
    }

    /// Split `metadata` into its filterable and non-filterable parts, enforcing limits.
    ///
    /// # Errors
    ///
    /// Returns [`VectorIndexError::TooManyMetadataKeys`] or
    /// [`VectorIndexError::FilterableMetadataTooLarge`] when the record would exceed a
    /// ceiling. Nothing is truncated or dropped.
    pub fn split(&self, metadata: &Metadata) -> Result<SplitMetadata, VectorIndexError> {
        let mut filterable = Vec::new();
        let mut attributes = serde_json::Map::new();
        for (name, value) in metadata.iter() {
            if self.filterable.contains(name) {
                filterable.push((name.to_owned(), value.clone()));
            } else {
                attributes.insert(name.to_owned(), serde_json::to_value(value)?);
            }
        }

        let filterable_json = serde_json::Value::Object(
            filterable
                .iter()
                .map(|(k, v)| serde_json::to_value(v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        );
        let filterable_bytes = serde_json::to_vec(&filterable_json)?.len();

        if let Some(limits) = self.limits {
            let keys = filterable.len() + 2;
            if keys > limits.max_keys {
                return Err(VectorIndexError::TooManyMetadataKeys {
                    count: keys,
                    limit: limits.max_keys,
                });
            }
            if filterable_bytes > limits.max_filterable_bytes {
                return Err(VectorIndexError::FilterableMetadataTooLarge {
                    size: filterable_bytes,
                    limit: limits.max_filterable_bytes,
                });
            }
        }

        Ok(SplitMetadata {
            filterable,
            attributes,
            filterable_bytes,
        })
    }
}

/// Result of [`Capabilities::split`].
#[derive(Debug, Clone)]
pub struct SplitMetadata {
    pub filterable: Vec<(String, MetaValue)>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub filterable_bytes: usize,
}

impl SplitMetadata {
    /// Reassemble the original metadata from both parts.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if an attribute does not decode as a [`MetaValue`].
    pub fn rejoin(
        filterable: impl IntoIterator<Item = (String, MetaValue)>,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Metadata, serde_json::Error> {
        let mut meta: Metadata = filterable.into_iter().collect();
        for (k, v) in attributes {
            meta.set_extra(k, serde_json::from_value::<MetaValue>(v)?);
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited() -> Capabilities {
        Capabilities {
            filterable: FilterableFields::essential(),
            limits: Some(MetadataLimits::default()),
        }
    }

    fn chunk_meta() -> Metadata {
        Metadata::new()
            .with(MetaKey::ChunkId, "c1")
            .with(MetaKey::Module, "orders")
            .with(MetaKey::FilePath, "src/OrderService.java")
            .with(MetaKey::FileType, "java")
            .with(MetaKey::ChunkType, "class")
            .with(MetaKey::Layer, "service")
            .with(MetaKey::ClassName, "OrderService")
            .with(MetaKey::Package, "com.acme.orders")
            .with(MetaKey::LineStart, 1_i64)
            .with(MetaKey::Annotations, vec!["@Service".to_owned()])
    }

    #[test]
    fn essential_fields_fit_default_limits() {
        let split = limited().split(&chunk_meta()).unwrap();
        assert_eq!(split.filterable.len(), 8);
        assert!(split.attributes.contains_key("line_start"));
        assert!(split.attributes.contains_key("annotations"));
        assert!(split.filterable_bytes <= 2048);
    }

    #[test]
    fn too_many_filterable_keys_fails_loudly() {
        let caps = Capabilities {
            filterable: FilterableFields::All,
            limits: Some(MetadataLimits::default()),
        };
        let err = caps.split(&chunk_meta()).unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::TooManyMetadataKeys {
                count: 12,
                limit: 10
            }
        ));
    }

    #[test]
    fn oversized_filterable_portion_fails_loudly() {
        let meta = chunk_meta().with(MetaKey::Package, "p".repeat(3000));
        let err = limited().split(&meta).unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::FilterableMetadataTooLarge { limit: 2048, .. }
        ));
    }

    #[test]
    fn large_values_are_fine_when_non_filterable() {
        let meta = chunk_meta().with_extra("imports", vec!["x".repeat(5000)]);
        assert!(limited().split(&meta).is_ok());
    }

    #[test]
    fn unrestricted_never_fails() {
        let meta = chunk_meta().with(MetaKey::Package, "p".repeat(10_000));
        let split = Capabilities::unrestricted().split(&meta).unwrap();
        assert!(split.attributes.is_empty());
    }

    #[test]
    fn check_filter_rejects_non_filterable_field() {
        let f = MetadataFilter::new().text_eq("annotations", "@Service");
        assert!(matches!(
            limited().check_filter(&f),
            Err(VectorIndexError::NonFilterableField(field)) if field == "annotations"
        ));
        assert!(
            limited()
                .check_filter(&MetadataFilter::new().text_eq("layer", "service"))
                .is_ok()
        );
    }

    #[test]
    fn rejoin_restores_metadata() {
        let meta = chunk_meta();
        let split = limited().split(&meta).unwrap();
        let back = SplitMetadata::rejoin(split.filterable, split.attributes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn chunk_id_always_filterable() {
        let f = FilterableFields::only(["layer"]);
        assert!(f.contains("chunk_id"));
    }
}
