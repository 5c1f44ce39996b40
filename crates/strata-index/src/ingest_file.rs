//! The JSON hand-off file between extraction and embedding.

use std::path::Path;

use crate::composer::ComposedChunk;
use crate::error::Result;

/// Write `records` as a pretty-printed JSON array, creating parent directories.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_ingest_file(path: &Path, records: &[ComposedChunk]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(records)?;
    tokio::fs::write(path, json).await?;
    tracing::info!(path = %path.display(), records = records.len(), "ingest file written");
    Ok(())
}

/// Read an ingest file written by [`write_ingest_file`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a JSON array of records.
pub async fn read_ingest_file(path: &Path) -> Result<Vec<ComposedChunk>> {
    let bytes = tokio::fs::read(path).await?;
    let records: Vec<ComposedChunk> = serde_json::from_slice(&bytes)?;
    tracing::debug!(path = %path.display(), records = records.len(), "ingest file read");
    Ok(records)
}
