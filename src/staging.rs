//! CSV staging artifact between extraction and load.
//!
//! The first record is the header (source column names). Empty fields read
//! back as `None`; the artifact does not distinguish NULL from empty text.

use std::fs::File;
use std::path::{Path, PathBuf};

use sync_core::{Result, RowSink, StagedRow, SyncError};
use tracing::{debug, warn};

/// `<data_dir>/<source_table>_EXTRACT_<run_id>.csv`
pub fn staging_path(data_dir: &Path, source_table: &str, run_id: &str) -> PathBuf {
    data_dir.join(format!("{source_table}_EXTRACT_{run_id}.csv"))
}

fn staging_error(path: &Path, err: impl std::fmt::Display) -> SyncError {
    SyncError::Staging(format!("{}: {err}", path.display()))
}

/// Writes extracted rows; implements [`RowSink`].
pub struct StagingWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl StagingWriter {
    /// Create (or truncate) the artifact and write the header.
    pub fn create(path: &Path, headers: &[String]) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| staging_error(dir, e))?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(|e| staging_error(path, e))?;
        writer
            .write_record(headers)
            .map_err(|e| staging_error(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    /// Flush and return the number of data rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush().map_err(|e| staging_error(&self.path, e))?;
        debug!("Staged {} rows to {}", self.rows, self.path.display());
        Ok(self.rows)
    }
}

impl RowSink for StagingWriter {
    fn write_row(&mut self, row: &StagedRow) -> Result<()> {
        self.writer
            .write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))
            .map_err(|e| staging_error(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }
}

/// Reads the artifact back row by row.
pub struct StagingReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: Vec<String>,
}

impl StagingReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| staging_error(path, e))?;
        let headers = reader
            .headers()
            .map_err(|e| staging_error(path, e))?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Next data row, or `None` at end of file.
    pub fn next_row(&mut self) -> Result<Option<StagedRow>> {
        let mut record = csv::StringRecord::new();
        let more = self
            .reader
            .read_record(&mut record)
            .map_err(|e| staging_error(&self.path, e))?;
        if !more {
            return Ok(None);
        }
        Ok(Some(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        None
                    } else {
                        Some(field.to_string())
                    }
                })
                .collect(),
        ))
    }
}

/// Remove a staging artifact, logging instead of failing.
pub fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed staging artifact {}", path.display()),
        Err(e) => warn!("Failed to remove staging artifact {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path_layout() {
        assert_eq!(
            staging_path(Path::new("/data"), "orders", "01072024100000_1234"),
            PathBuf::from("/data/orders_EXTRACT_01072024100000_1234.csv")
        );
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("orders.csv");
        let headers = vec!["id".to_string(), "note".to_string()];

        let mut writer = StagingWriter::create(&path, &headers).unwrap();
        writer
            .write_row(&vec![Some("1".to_string()), Some("a, \"quoted\" note".to_string())])
            .unwrap();
        writer.write_row(&vec![Some("2".to_string()), None]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let mut reader = StagingReader::open(&path).unwrap();
        assert_eq!(reader.headers(), headers.as_slice());
        assert_eq!(
            reader.next_row().unwrap(),
            Some(vec![
                Some("1".to_string()),
                Some("a, \"quoted\" note".to_string())
            ])
        );
        assert_eq!(
            reader.next_row().unwrap(),
            Some(vec![Some("2".to_string()), None])
        );
        assert_eq!(reader.next_row().unwrap(), None);

        discard(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_artifact_is_staging_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StagingReader::open(&dir.path().join("absent.csv"))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Staging(_)));
    }
}
