//! Extraction engine: source table → staging artifact.

use std::path::{Path, PathBuf};

use sync_core::{Connector, LoadCondition, Result, SourceStore};
use tracing::{info, warn};

use crate::staging::StagingWriter;

/// What an extraction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub staging_path: PathBuf,
    /// Rows streamed into the artifact
    pub rows_written: u64,
    /// Rows matching the condition, counted after streaming; this is the
    /// audited row count
    pub matching_rows: u64,
}

/// Stream every row of `table` matching `condition` into a fresh staging
/// artifact at `staging_path`, then re-count the matching rows.
///
/// Opens its own source connection and drops it before returning, on
/// success and on error alike. Never touches the target.
pub async fn extract_to_staging<C: Connector>(
    connector: &C,
    table: &str,
    condition: &LoadCondition,
    staging_path: &Path,
) -> Result<Extraction> {
    let mut source = connector.connect_source().await?;
    info!("Source connection established for extraction of {table}");

    let headers = source.columns(table).await?;
    let mut writer = StagingWriter::create(staging_path, &headers)?;
    source.extract(table, condition, &mut writer).await?;
    let rows_written = writer.finish()?;

    let matching_rows = u64::try_from(source.count(table, condition).await?).unwrap_or_default();
    drop(source);

    if rows_written != matching_rows {
        warn!(
            "{table}: staged {rows_written} rows but {matching_rows} match now; \
             the source changed during extraction"
        );
    }
    info!(
        "Extracted {rows_written} rows from {table} to {}",
        staging_path.display()
    );

    Ok(Extraction {
        staging_path: staging_path.to_path_buf(),
        rows_written,
        matching_rows,
    })
}
