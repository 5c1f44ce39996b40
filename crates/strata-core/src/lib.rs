//! Configuration loading and construction of the embedding and indexing pipeline.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{Pipeline, create_embedder, create_index, load_config, resolve_config_path};
pub use config::Config;
