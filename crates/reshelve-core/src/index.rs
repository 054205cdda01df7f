//! Newline-delimited JSON streams.
//!
//! The metadata index, plans, undo plans and blocked-move logs are all
//! append-only files with one JSON document per line. Readers parse a single
//! line at a time, so none of these artifacts is ever fully materialized.

use crate::error::Error;
use crate::model::FileRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

pub type MetadataWriter = NdjsonWriter<FileRecord>;
pub type MetadataReader = NdjsonReader<FileRecord>;

pub struct NdjsonWriter<T> {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
    flush_each: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> NdjsonWriter<T> {
    /// Create (or truncate) `path`.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            written: 0,
            flush_each: false,
            _marker: PhantomData,
        })
    }

    /// Flush to the OS after every record. Used for undo plans so that an
    /// interrupted run leaves every completed move on disk.
    pub fn flush_each_record(mut self) -> Self {
        self.flush_each = true;
        self
    }

    pub fn write(&mut self, item: &T) -> Result<(), Error> {
        serde_json::to_writer(&mut self.out, item)?;
        self.out.write_all(b"\n")?;
        if self.flush_each {
            self.out.flush()?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync. Returns the number of records written.
    pub fn finish(mut self) -> Result<usize, Error> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.written)
    }
}

pub struct NdjsonReader<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> NdjsonReader<T> {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh pass over the file. Each call reopens it, so multi-pass
    /// consumers (clustering) simply call this again.
    pub fn records(&self) -> Result<Records<T>, Error> {
        let file = File::open(&self.path)?;
        Ok(Records {
            path: self.path.clone(),
            lines: BufReader::new(file),
            line_no: 0,
            malformed: 0,
            buf: String::new(),
            _marker: PhantomData,
        })
    }
}

/// Lazy line-by-line iterator. Blank lines are ignored; malformed lines (for
/// instance a torn final line after a crash) are logged and skipped.
pub struct Records<T> {
    path: PathBuf,
    lines: BufReader<File>,
    line_no: usize,
    malformed: usize,
    buf: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Records<T> {
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

impl<T: DeserializeOwned> Iterator for Records<T> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.lines.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(Error::Io(e))),
            }
            self.line_no += 1;
            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => return Some(Ok(item)),
                Err(e) => {
                    self.malformed += 1;
                    warn!(
                        "Skipping malformed line {} in {}: {}",
                        self.line_no,
                        self.path.display(),
                        e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[test]
    fn test_reader_is_restartable_and_skips_torn_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rows.ndjson");
        let mut writer = NdjsonWriter::<Row>::create(&path).unwrap();
        writer.write(&Row { n: 1 }).unwrap();
        writer.write(&Row { n: 2 }).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        // Simulate an interrupted append.
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"\n{\"n\": 3").unwrap();

        let reader = NdjsonReader::<Row>::open(&path).unwrap();
        for _ in 0..2 {
            let mut records = reader.records().unwrap();
            let rows: Vec<Row> = records.by_ref().map(Result::unwrap).collect();
            assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
            assert_eq!(records.malformed(), 1);
        }
    }

    #[test]
    fn test_open_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(NdjsonReader::<Row>::open(&tmp.path().join("missing")).is_err());
    }
}
