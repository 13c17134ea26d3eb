//! Lazy record decoding over the merged local artifact.
//!
//! The artifact is gzip NDJSON. Records are decoded one line at a time, so
//! memory use does not grow with the result size. Closing the iterator (or
//! dropping it) removes the artifact.

use flate2::read::MultiGzDecoder;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::emit;
use crate::error::{ArtifactRemoveSnafu, DecodeError, IteratorClosedSnafu, RecordJsonSnafu};
use crate::metrics::events::RecordsDecoded;
use crate::warehouse::ResultSchema;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One decoded row, keyed by column name.
pub type Record = Map<String, Value>;

/// Where the iterator's single cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    /// More records may follow.
    Ready,
    /// End of stream reached; further reads return `None`.
    Exhausted,
    /// Closed and the artifact removed.
    Closed,
}

/// Forward-only reader over an export's records.
#[derive(Debug)]
pub struct RecordIterator {
    schema: ResultSchema,
    path: PathBuf,
    reader: Option<BufReader<MultiGzDecoder<File>>>,
    state: IteratorState,
    line: u64,
    decoded: u64,
    buf: String,
}

impl RecordIterator {
    /// Open the artifact at `path`. Ownership of the file passes to the
    /// iterator, which removes it on close.
    pub fn open(path: impl Into<PathBuf>, schema: ResultSchema) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        debug!("Opened record stream {}", path.display());

        Ok(Self {
            schema,
            path,
            reader: Some(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                MultiGzDecoder::new(file),
            )),
            state: IteratorState::Ready,
            line: 0,
            decoded: 0,
            buf: String::new(),
        })
    }

    pub fn schema(&self) -> &ResultSchema {
        &self.schema
    }

    /// Row count the warehouse reported for the result.
    pub fn total_rows(&self) -> u64 {
        self.schema.total_rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    /// Records decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Decode the next record.
    ///
    /// Returns `Ok(None)` at the end of the stream, and keeps doing so on
    /// later calls. Blank lines are skipped. A line that fails to decode is
    /// reported and consumed; the next call continues after it.
    pub fn next_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.state {
            IteratorState::Closed => return IteratorClosedSnafu.fail(),
            IteratorState::Exhausted => return Ok(None),
            IteratorState::Ready => {}
        }
        let Some(reader) = self.reader.as_mut() else {
            self.state = IteratorState::Exhausted;
            return Ok(None);
        };

        loop {
            self.buf.clear();
            let read = match reader.read_line(&mut self.buf) {
                Ok(read) => read,
                Err(source) => {
                    self.finish_reading();
                    return Err(DecodeError::RecordRead { source });
                }
            };
            if read == 0 {
                self.finish_reading();
                return Ok(None);
            }

            self.line += 1;
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }

            let record = serde_json::from_str(text).context(RecordJsonSnafu { line: self.line })?;
            self.decoded += 1;
            return Ok(Some(record));
        }
    }

    /// Iterate records decoded as `T`.
    pub fn records<T: DeserializeOwned>(&mut self) -> Records<'_, T> {
        Records {
            iter: self,
            _marker: PhantomData,
        }
    }

    fn finish_reading(&mut self) {
        if self.reader.take().is_some() {
            emit!(RecordsDecoded {
                count: self.decoded,
            });
        }
        self.state = IteratorState::Exhausted;
    }

    /// Release the file handle and remove the artifact.
    ///
    /// Closing twice is fine; the second call does nothing.
    pub fn close(&mut self) -> Result<(), DecodeError> {
        if self.state == IteratorState::Closed {
            return Ok(());
        }
        if self.reader.is_some() {
            self.finish_reading();
        }
        self.state = IteratorState::Closed;

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed record stream {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(ArtifactRemoveSnafu { path: &self.path }),
        }
    }
}

impl Iterator for RecordIterator {
    type Item = Result<Record, DecodeError>;

    /// Ends after exhaustion, after a read error, or once closed.
    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IteratorState::Closed {
            return None;
        }
        self.next_record().transpose()
    }
}

impl Drop for RecordIterator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to clean up record stream: {}", e);
        }
    }
}

/// Typed view returned by [`RecordIterator::records`].
pub struct Records<'a, T> {
    iter: &'a mut RecordIterator,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for Records<'_, T> {
    type Item = Result<T, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.iter.state == IteratorState::Closed {
            return None;
        }
        self.iter.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde::Deserialize;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_artifact(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    fn schema(total_rows: u64) -> ResultSchema {
        ResultSchema {
            columns: Vec::new(),
            total_rows,
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        id: u64,
        name: String,
    }

    #[test]
    fn test_yields_records_then_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(
            &dir,
            "a.json.gz",
            "{\"id\":1,\"name\":\"a\"}\n\n{\"id\":2,\"name\":\"b\"}\n",
        );
        let mut records = RecordIterator::open(&path, schema(2)).unwrap();

        assert_eq!(records.total_rows(), 2);
        let first: Row = records.next_record().unwrap().unwrap();
        assert_eq!(first, Row { id: 1, name: "a".to_string() });
        let second: Row = records.next_record().unwrap().unwrap();
        assert_eq!(second.id, 2);

        assert!(records.next_record::<Row>().unwrap().is_none());
        assert!(records.next_record::<Row>().unwrap().is_none());
        assert_eq!(records.state(), IteratorState::Exhausted);
        assert_eq!(records.decoded(), 2);
    }

    #[test]
    fn test_untyped_iteration() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "b.json.gz", "{\"x\":1}\n{\"x\":2}\n{\"x\":3}\n");
        let records = RecordIterator::open(&path, schema(3)).unwrap();

        let values: Vec<Record> = records.map(Result::unwrap).collect();
        assert_eq!(values.len(), 3);
        assert_eq!(values[2]["x"], 3);
    }

    #[test]
    fn test_typed_adapter() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "c.json.gz", "{\"id\":7,\"name\":\"z\"}\n");
        let mut records = RecordIterator::open(&path, schema(1)).unwrap();

        let rows: Vec<Row> = records.records::<Row>().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows, vec![Row { id: 7, name: "z".to_string() }]);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "d.json.gz", "{\"x\":1}\n{not json}\n{\"x\":3}\n");
        let mut records = RecordIterator::open(&path, schema(3)).unwrap();

        assert!(records.next_record::<Record>().unwrap().is_some());
        match records.next_record::<Record>() {
            Err(DecodeError::RecordJson { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        let third: Record = records.next_record().unwrap().unwrap();
        assert_eq!(third["x"], 3);
    }

    #[test]
    fn test_empty_artifact() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "e.json.gz", "");
        let mut records = RecordIterator::open(&path, schema(0)).unwrap();

        assert!(records.next().is_none());
        assert!(records.next_record::<Record>().unwrap().is_none());
    }

    #[test]
    fn test_close_is_idempotent_and_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "f.json.gz", "{\"x\":1}\n");
        let mut records = RecordIterator::open(&path, schema(1)).unwrap();

        records.close().unwrap();
        assert!(!path.exists());
        assert_eq!(records.state(), IteratorState::Closed);

        // A file recreated at the same path is not touched by a second close
        std::fs::write(&path, b"new").unwrap();
        records.close().unwrap();
        assert!(path.exists());

        assert!(matches!(
            records.next_record::<Record>(),
            Err(DecodeError::IteratorClosed)
        ));
        assert!(records.next().is_none());
    }

    #[test]
    fn test_drop_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(&dir, "g.json.gz", "{\"x\":1}\n");
        {
            let mut records = RecordIterator::open(&path, schema(1)).unwrap();
            records.next();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_artifact_ends_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.json.gz");
        std::fs::write(&path, b"not gzip at all").unwrap();
        let mut records = RecordIterator::open(&path, schema(0)).unwrap();

        assert!(matches!(
            records.next_record::<Record>(),
            Err(DecodeError::RecordRead { .. })
        ));
        assert!(records.next().is_none());
        assert_eq!(records.state(), IteratorState::Exhausted);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(RecordIterator::open(dir.path().join("missing.json.gz"), schema(0)).is_err());
    }
}
