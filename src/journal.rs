use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CcdError, ErrorKind};
use crate::types::ExposureKind;

/// What happened to one attempted shot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShotOutcome {
    Acquired,
    HeaderWriteFailed { message: String },
    Failed { error_kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotRecord {
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub kind: ExposureKind,
    pub index: usize,
    pub seq_num: u64,
    pub path: PathBuf,
    pub exposure_time_s: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub voltages: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub outcome: ShotOutcome,
}

/// Buffered JSON-lines writer; one line per record
#[derive(Debug)]
pub struct Journal<T>
where
    T: Serialize,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Journal<T>
where
    T: Serialize,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            path.set_extension("jsonl");
        }
        let buffer_size = buffer_size.max(1);
        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, record: T) -> Result<(), CcdError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append buffered records. Transient failures keep the buffer and only
    /// become an error after `max_flush_failures` in a row.
    pub fn flush(&mut self) -> Result<(), CcdError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                debug!(
                    "Journal flushed {} records to {}",
                    self.buffer.len(),
                    self.file_path.display()
                );
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Journal flush failure {}/{}: {}",
                    self.flush_failures, self.max_flush_failures, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent journal failures ({}/{})",
                        self.flush_failures, self.max_flush_failures
                    );
                }
                if self.flush_failures >= self.max_flush_failures {
                    return Err(CcdError::io(
                        std::io::Error::other(e.to_string()),
                        format!(
                            "too many consecutive flush failures ({}) for {}",
                            self.max_flush_failures,
                            self.file_path.display()
                        ),
                    ));
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), CcdError> {
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CcdError::io(e, format!("creating {}", parent.display())))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|e| CcdError::io(e, format!("opening {}", self.file_path.display())))?;

        let mut writer = std::io::BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line)
                .map_err(|e| CcdError::io(e, "writing journal line"))?;
        }
        writer
            .flush()
            .map_err(|e| CcdError::io(e, "flushing journal"))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Journal<T>
where
    T: Serialize,
{
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every record back from a journal file
pub fn read_records(path: &Path) -> Result<Vec<ShotRecord>, CcdError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CcdError::io(e, format!("reading {}", path.display())))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(CcdError::from))
        .collect()
}
