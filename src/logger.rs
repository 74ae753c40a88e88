use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use std::{io::Write, path::PathBuf};

use crate::error::SweepError;

/// Buffered JSONL experiment log
///
/// Entries are appended as one JSON object per line whenever the buffer
/// fills, and on drop. With `final_format_json` the file is rewritten as a
/// single JSON array once the run is over.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();

        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), SweepError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Append buffered entries to the file
    ///
    /// Transient failures keep the buffer and return `Ok`; only after
    /// `max_flush_failures` consecutive failures is an error returned.
    pub fn flush(&mut self) -> Result<(), SweepError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let write_result = (|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            let mut writer = std::io::BufWriter::new(file);
            for data in &self.buffer {
                let json_line = serde_json::to_string(data)?;
                writeln!(writer, "{}", json_line)?;
            }
            writer.flush()?;
            Ok::<(), Box<dyn std::error::Error>>(())
        })();

        match write_result {
            Ok(()) => {
                self.flush_failures = 0;
                debug!(
                    "Flushed {} log entries to {:?}",
                    self.buffer.len(),
                    self.file_path
                );
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures % 3 == 0 {
                    log::warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures,
                        self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(SweepError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                // a sweep must not die on a transient log write
                Ok(())
            }
        }
    }

    /// Rewrite the JSONL file as a pretty-printed JSON array
    pub fn finalize_as_json(&mut self) -> Result<(), SweepError> {
        if !self.final_format_json {
            return Ok(());
        }

        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| SweepError::Io {
            source,
            context: format!("Could not read JSONL file at {:?}", self.file_path),
        })?;

        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // already converted by an earlier call
            if line.starts_with('[') {
                return Ok(());
            }
            let data: T = serde_json::from_str(line)?;
            entries.push(data);
        }

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output).map_err(|source| SweepError::Io {
            source,
            context: format!("Could not write JSON file at {:?}", self.file_path),
        })?;

        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}
