//! Results sinks.
//!
//! A sink receives the column schema once, then one row per tick,
//! append-only. `CsvSink` writes a timestamp-named CSV file with a
//! `#`-prefixed JSON metadata header; `MemorySink` keeps rows in memory for
//! tests and dry runs.

use crate::acquisition::{ColumnSchema, Row};
use crate::error::AppResult;
use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(feature = "storage_csv")]
use crate::error::DaqError;
#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::io::Write;

/// Append-only destination for acquisition rows.
#[async_trait]
pub trait ResultsSink: Send {
    /// Receive the schema; called once before the first row.
    async fn begin(&mut self, schema: &ColumnSchema) -> AppResult<()>;

    /// Append one row in schema order.
    async fn append(&mut self, row: &Row) -> AppResult<()>;

    /// Flush and close; called once after the last row.
    async fn finish(&mut self) -> AppResult<()>;
}

// =============================================================================
// CsvSink
// =============================================================================

/// CSV results file, named from the start-of-run timestamp.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    directory: PathBuf,
    metadata: serde_json::Value,
    path: Option<PathBuf>,
    writer: Option<csv::Writer<File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create a sink writing into `directory` (created if missing).
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            metadata: serde_json::Value::Null,
            path: None,
            writer: None,
        }
    }

    /// Attach run metadata, written as `# `-prefixed JSON header lines.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Path of the file being written, once `begin` has run.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl ResultsSink for CsvSink {
    async fn begin(&mut self, schema: &ColumnSchema) -> AppResult<()> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory)
                .map_err(|e| DaqError::Storage(e.to_string()))?;
        }

        let file_name = format!("{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S_%f"));
        let path = self.directory.join(file_name);

        let mut file = File::create(&path).map_err(|e| {
            DaqError::Storage(format!("Failed to create results file: {e}"))
        })?;

        if !self.metadata.is_null() {
            let json_string = serde_json::to_string_pretty(&self.metadata)
                .map_err(|e| DaqError::Storage(e.to_string()))?;
            for line in json_string.lines() {
                writeln!(file, "# {line}").map_err(|e| DaqError::Storage(e.to_string()))?;
            }
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(schema.columns())
            .map_err(|e| DaqError::Storage(e.to_string()))?;

        log::info!("Results file '{}' opened", path.display());
        self.path = Some(path);
        self.writer = Some(writer);
        Ok(())
    }

    async fn append(&mut self, row: &Row) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("CSV sink used before begin".to_string()))?;
        let record: Vec<String> = row.values.iter().map(|v| v.to_string()).collect();
        writer
            .write_record(&record)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| DaqError::Storage(e.to_string()))?;
            log::info!("Results file closed");
        }
        Ok(())
    }
}

/// CSV results file, named from the start-of-run timestamp.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvSink;

#[cfg(not(feature = "storage_csv"))]
impl CsvSink {
    /// Create a sink writing into `directory` (requires `storage_csv`).
    pub fn new(_directory: impl Into<PathBuf>) -> Self {
        Self
    }

    /// Attach run metadata (requires `storage_csv`).
    pub fn with_metadata(self, _metadata: serde_json::Value) -> Self {
        self
    }
}

#[cfg(not(feature = "storage_csv"))]
#[async_trait]
impl ResultsSink for CsvSink {
    async fn begin(&mut self, _schema: &ColumnSchema) -> AppResult<()> {
        Err(crate::error::DaqError::FeatureNotEnabled(
            "storage_csv".to_string(),
        ))
    }

    async fn append(&mut self, _row: &Row) -> AppResult<()> {
        Err(crate::error::DaqError::FeatureNotEnabled(
            "storage_csv".to_string(),
        ))
    }

    async fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// In-memory sink for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    schema: Option<ColumnSchema>,
    rows: Vec<Row>,
    finished: bool,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The schema received at `begin`, if any.
    pub fn schema(&self) -> Option<&ColumnSchema> {
        self.schema.as_ref()
    }

    /// Rows appended so far.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Whether `finish` has been called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl ResultsSink for MemorySink {
    async fn begin(&mut self, schema: &ColumnSchema) -> AppResult<()> {
        self.schema = Some(schema.clone());
        Ok(())
    }

    async fn append(&mut self, row: &Row) -> AppResult<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}
