use std::str::FromStr;

use serde::de::DeserializeOwned;

use super::{Config, Secret};

/// Parse `key` with `FromStr`, warning on values that do not parse.
fn parsed_var<T: FromStr>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    match v.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {v}");
            None
        }
    }
}

/// Parse `key` as a serde enum name (`"sqlite"`, `"cosine"`, ...).
fn enum_var<T: DeserializeOwned>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.trim().to_lowercase())) {
        Some(kind)
    } else {
        tracing::warn!("ignoring invalid {key} value: {v}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_embedding();
        self.apply_env_overrides_index();
        if let Ok(v) = std::env::var("STRATA_EXTRACT_MODULE_PATTERN") {
            self.extract.module_pattern = (!v.trim().is_empty()).then_some(v);
        }
        self.resolve_secrets();
    }

    fn apply_env_overrides_embedding(&mut self) {
        if let Some(kind) = enum_var("STRATA_EMBEDDING_PROVIDER") {
            self.embedding.provider = kind;
        }
        if let Ok(v) = std::env::var("STRATA_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("STRATA_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Some(dimension) = parsed_var::<usize>("STRATA_EMBEDDING_DIMENSION") {
            self.embedding.dimension = Some(dimension);
        }
        if let Some(size) = parsed_var::<usize>("STRATA_EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = size;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Some(kind) = enum_var("STRATA_INDEX_BACKEND") {
            self.index.backend = kind;
        }
        if let Some(metric) = enum_var("STRATA_INDEX_METRIC") {
            self.index.metric = metric;
        }
        if let Ok(v) = std::env::var("STRATA_SQLITE_PATH") {
            self.index.sqlite.path = v;
        }
        if let Ok(v) = std::env::var("STRATA_QDRANT_URL") {
            self.index.qdrant.url = v;
        }
        if let Ok(v) = std::env::var("STRATA_QDRANT_COLLECTION") {
            self.index.qdrant.collection = v;
        }
    }

    fn resolve_secrets(&mut self) {
        let key = std::env::var("STRATA_EMBEDDING_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Some(key) = key {
            self.secrets.embedding_api_key = Some(Secret::new(key));
        }
    }
}
