//! Results table and CSV flush in authored order.
//!
//! Workers push rows as requests complete; completion order in a concurrent
//! sequence is arbitrary, so the final flush sorts rows by
//! `(sequence-index, request-index)` before writing the CSV. The table is
//! created up front so an unwritable results path fails the run before any
//! request is dispatched.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors that can occur while writing the results CSV.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Filesystem operation failed.
    #[error("IO operation failed on path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// CSV serialization failed.
    #[error("Failed to write results CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    /// The results mutex was poisoned by a panicking worker.
    #[error("Results table lock poisoned")]
    Poisoned,
}

/// One row of the results table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    /// 1-based authored position of the sequence.
    pub sequence_index: usize,
    /// 1-based authored position of the request within its sequence.
    pub request_index: usize,
    /// Sequence name.
    pub sequence: String,
    /// Request key.
    pub request: String,
    /// Attempt-start timestamp, UTC ISO-8601.
    pub timestamp: String,
    /// Final HTTP status, 0 for dry runs, -1 when no response was received.
    pub status: i32,
    /// Total duration across all attempts, in milliseconds.
    pub duration_ms: u64,
    /// Number of sends made, 0 for dry runs.
    pub attempts: u32,
}

const HEADER: [&str; 6] = [
    "sequence",
    "request",
    "timestamp",
    "status",
    "duration_ms",
    "attempts",
];

/// Shared, append-only collection of result rows.
#[derive(Debug)]
pub struct ResultsTable {
    path: PathBuf,
    rows: Mutex<Vec<ResultRow>>,
}

impl ResultsTable {
    /// Creates the CSV with its header row. Failing here is fatal for the
    /// run, before anything is dispatched.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let table = ResultsTable {
            path: path.to_path_buf(),
            rows: Mutex::new(Vec::new()),
        };
        table.write_rows(&[])?;
        Ok(table)
    }

    /// Records one completed request.
    pub fn push(&self, row: ResultRow) -> Result<(), Error> {
        let mut rows = self.rows.lock().map_err(|_| Error::Poisoned)?;
        rows.push(row);
        Ok(())
    }

    /// Number of recorded rows.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows whose final status is exactly HTTP 200.
    pub fn ok_count(&self) -> usize {
        self.rows
            .lock()
            .map(|rows| rows.iter().filter(|r| r.status == 200).count())
            .unwrap_or(0)
    }

    /// Sorts rows into authored order and rewrites the CSV.
    pub fn flush(&self) -> Result<(), Error> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| Error::Poisoned)?
            .clone();
        rows.sort_by_key(|row| (row.sequence_index, row.request_index));
        self.write_rows(&rows)
    }

    fn write_rows(&self, rows: &[ResultRow]) -> Result<(), Error> {
        let file = std::fs::File::create(&self.path).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER).map_err(|source| Error::Csv {
            path: self.path.clone(),
            source,
        })?;
        for row in rows {
            let status = row.status.to_string();
            let duration = row.duration_ms.to_string();
            let attempts = row.attempts.to_string();
            writer
                .write_record([
                    row.sequence.as_str(),
                    row.request.as_str(),
                    row.timestamp.as_str(),
                    status.as_str(),
                    duration.as_str(),
                    attempts.as_str(),
                ])
                .map_err(|source| Error::Csv {
                    path: self.path.clone(),
                    source,
                })?;
        }
        writer.flush().map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(seq: usize, req: usize, status: i32) -> ResultRow {
        ResultRow {
            sequence_index: seq,
            request_index: req,
            sequence: format!("seq-{seq}"),
            request: format!("req-{req}"),
            timestamp: "2025-09-17T19:35:00Z".to_string(),
            status,
            duration_ms: 12,
            attempts: 1,
        }
    }

    #[test]
    fn test_create_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        ResultsTable::create(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.trim(),
            "sequence,request,timestamp,status,duration_ms,attempts"
        );
    }

    #[test]
    fn test_flush_sorts_by_authored_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let table = ResultsTable::create(&path).unwrap();
        // Completion order deliberately scrambled.
        table.push(row(2, 1, 200)).unwrap();
        table.push(row(1, 2, 200)).unwrap();
        table.push(row(1, 1, 503)).unwrap();
        table.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("seq-1,req-1"));
        assert!(lines[2].starts_with("seq-1,req-2"));
        assert!(lines[3].starts_with("seq-2,req-1"));
    }

    #[test]
    fn test_ok_count_requires_exactly_200() {
        let dir = tempfile::tempdir().unwrap();
        let table = ResultsTable::create(&dir.path().join("results.csv")).unwrap();
        table.push(row(1, 1, 200)).unwrap();
        table.push(row(1, 2, 204)).unwrap();
        table.push(row(1, 3, -1)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.ok_count(), 1);
    }

    #[test]
    fn test_create_fails_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("results.csv");
        assert!(matches!(
            ResultsTable::create(&path),
            Err(Error::Io { .. })
        ));
    }
}
