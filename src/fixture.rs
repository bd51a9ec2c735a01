//! Shared fixture store: CSV files handed between handles.
//!
//! A handle may read records from an existing CSV file, write records for a
//! later scenario, or both. The store is keyed by handle name; the filename
//! is an attribute, and filename uniqueness across handles is enforced at
//! configuration load. Reader files must exist, writer files must not.

use std::fs::{File, OpenOptions};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("no csv read file found: {0}")]
    MissingReadFile(String),
    #[error("file {0} already exists, please rename the csv_write or csv_read file name in the configuration")]
    WriteFileExists(String),
    #[error("no fixture registered for handle [{0}]")]
    UnknownHandle(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Yields the records of a CSV file once, or cyclically when the recycle
/// flag is set.
#[derive(Debug)]
pub struct FixtureReader {
    records: Vec<Vec<String>>,
    position: usize,
    recycle: bool,
}

impl FixtureReader {
    /// Open and load the named file. The file must exist.
    pub fn open(path: impl AsRef<Path>, recycle: bool) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|_| FixtureError::MissingReadFile(path.display().to_string()))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);
        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            records.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self {
            records,
            position: 0,
            recycle,
        })
    }

    /// Next record, or `None` once a non-recycling reader is exhausted.
    pub fn next_record(&mut self) -> Option<Vec<String>> {
        if self.records.is_empty() {
            return None;
        }
        if self.position >= self.records.len() {
            if !self.recycle {
                return None;
            }
            self.position = 0;
        }
        let record = self.records[self.position].clone();
        self.position += 1;
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Append-only CSV writer. Creation fails when the target file pre-exists,
/// so a stale fixture is never overwritten.
#[derive(Debug)]
pub struct FixtureWriter {
    writer: csv::Writer<File>,
}

impl FixtureWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    FixtureError::WriteFileExists(path.display().to_string())
                }
                _ => FixtureError::Io(err),
            })?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
        })
    }

    /// Append one record and flush it, so a sequenced consumer opening the
    /// file later sees every record written so far.
    pub fn append(&mut self, fields: &[String]) -> Result<(), FixtureError> {
        self.writer.write_record(fields)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FixtureError> {
        self.writer.flush()?;
        Ok(())
    }
}
