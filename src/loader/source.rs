//! Delimited-text record source.
//!
//! Reading happens in two phases: [`RecordSource::read_header`] consumes the
//! first row as the column list and hands back a [`RecordStream`] that yields
//! the data rows. Field counts are not checked against the header here; a
//! short or long row reaches the database as-is and fails there.

use std::io::Read;
use std::sync::Arc;
use thiserror::Error;

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input has no header row")]
    MissingHeader,
    #[error("header column {0} is empty")]
    EmptyColumn(usize),
    #[error("failed to read record: {0}")]
    Read(#[from] csv::Error),
}

/// Ordered column names taken from the first row of the input.
///
/// Cloning is cheap; every worker shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Arc<[String]>,
}

impl Header {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One data row. Owned by exactly one worker once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based position of the row among data rows (the header is not counted).
    pub line: u64,
    pub fields: Vec<String>,
}

impl Record {
    pub fn new(line: u64, fields: Vec<String>) -> Self {
        Self { line, fields }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub delimiter: u8,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

/// A source that has not yet produced its header.
pub struct RecordSource<R> {
    reader: csv::Reader<R>,
}

impl<R: Read> RecordSource<R> {
    pub fn new(reader: R, options: SourceOptions) -> Self {
        let reader = csv::ReaderBuilder::new()
            .delimiter(options.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        Self { reader }
    }

    /// Consume the first row as the header and switch to streaming records.
    pub fn read_header(mut self) -> Result<(Header, RecordStream<R>), SourceError> {
        let mut row = csv::StringRecord::new();
        if !self.reader.read_record(&mut row)? {
            return Err(SourceError::MissingHeader);
        }

        let mut columns = Vec::with_capacity(row.len());
        for (index, raw) in row.iter().enumerate() {
            let raw = if index == 0 {
                raw.trim_start_matches(UTF8_BOM)
            } else {
                raw
            };
            let name = raw.trim();

            if name.is_empty() {
                return Err(SourceError::EmptyColumn(index));
            }
            columns.push(name.to_string());
        }

        let header = Header::new(columns);
        log::debug!("header: {} columns ({})", header.len(), header.columns().join(","));

        Ok((
            header,
            RecordStream {
                reader: self.reader,
                row,
                produced: 0,
            },
        ))
    }
}

/// Data rows following the header.
pub struct RecordStream<R> {
    reader: csv::Reader<R>,
    row: csv::StringRecord,
    produced: u64,
}

impl<R: Read> RecordStream<R> {
    /// Next data row, `Ok(None)` at end of input.
    pub fn next_record(&mut self) -> Result<Option<Record>, SourceError> {
        if !self.reader.read_record(&mut self.row)? {
            return Ok(None);
        }

        self.produced += 1;
        let fields = self.row.iter().map(str::to_string).collect();
        Ok(Some(Record::new(self.produced, fields)))
    }

    /// Number of data rows produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}
