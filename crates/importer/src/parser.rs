//! CSV schema validation and streaming row parsing
//!
//! The import file must start with the exact header
//! `Authors,Title,Genre,Description,Edition,Publisher,Year,Format,Pages,Country,ISBN`.
//! Rows are read one record at a time; a record that cannot be decoded or has
//! the wrong number of fields becomes a [`RowFailure`] and reading continues.
//!
//! Rows are numbered by the file line they start on, counting the header as
//! row 1. Blank lines are never rows but still advance the numbering.

use crate::errors::ImportError;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Required header, in order
pub const EXPECTED_HEADERS: [&str; 11] = [
    "Authors",
    "Title",
    "Genre",
    "Description",
    "Edition",
    "Publisher",
    "Year",
    "Format",
    "Pages",
    "Country",
    "ISBN",
];

const BOM: char = '\u{feff}';

/// One data row, cells trimmed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvRow {
    pub authors: String,
    pub title: String,
    pub genre: String,
    pub description: String,
    pub edition: String,
    pub publisher: String,
    pub year: String,
    pub format: String,
    pub pages: String,
    pub country: String,
    pub isbn: String,
}

impl CsvRow {
    /// Build a row by pairing each validated header with its field
    fn from_record(headers: &[String], record: &StringRecord) -> Self {
        let mut row = CsvRow::default();
        for (column, value) in headers.iter().zip(record.iter()) {
            let value = value.trim().to_string();
            match column.as_str() {
                "Authors" => row.authors = value,
                "Title" => row.title = value,
                "Genre" => row.genre = value,
                "Description" => row.description = value,
                "Edition" => row.edition = value,
                "Publisher" => row.publisher = value,
                "Year" => row.year = value,
                "Format" => row.format = value,
                "Pages" => row.pages = value,
                "Country" => row.country = value,
                "ISBN" => row.isbn = value,
                _ => {}
            }
        }
        row
    }
}

/// Why a single row was not imported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub message: String,
}

impl RowFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A data row with its 1-based row number (the header is row 1)
pub type ParsedRow = (u32, Result<CsvRow, RowFailure>);

/// Check a header line against [`EXPECTED_HEADERS`]
pub fn validate_headers(headers: &[String]) -> Result<(), ImportError> {
    let matches = headers.len() == EXPECTED_HEADERS.len()
        && headers.iter().zip(EXPECTED_HEADERS).all(|(got, want)| got == want);

    if matches {
        Ok(())
    } else {
        Err(ImportError::schema(headers))
    }
}

/// Forward-only reader over the data rows of a validated import file.
///
/// Yields `Err` only for failures that end the job (I/O); after one is
/// returned the iterator is exhausted.
pub struct RowReader<R: Read> {
    reader: csv::Reader<LineFeeds<R>>,
    headers: Vec<String>,
    record: ByteRecord,
    header_line: u64,
    done: bool,
}

impl RowReader<File> {
    /// Open an import file and validate its header
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl<R: Read> RowReader<R> {
    /// Read and validate the header line
    pub fn new(input: R) -> Result<Self, ImportError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(LineFeeds::new(input));

        let mut record = ByteRecord::new();
        if !read_record(&mut reader, &mut record)? {
            return Err(ImportError::schema(&[]));
        }

        let headers: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let field = String::from_utf8_lossy(field);
                let field: &str = if i == 0 { field.trim_start_matches(BOM) } else { &field };
                field.trim().to_string()
            })
            .collect();

        validate_headers(&headers)?;
        let header_line = record.position().map_or(1, |pos| pos.line());
        debug!(columns = headers.len(), line = header_line, "CSV header validated");

        Ok(Self {
            reader,
            headers,
            record,
            header_line,
            done: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Row number of a record starting on `line`
    fn row_at(&self, line: u64) -> u32 {
        u32::try_from(line.saturating_sub(self.header_line) + 1).unwrap_or(u32::MAX)
    }

    fn decode(&self) -> Result<CsvRow, RowFailure> {
        if self.record.len() != self.headers.len() {
            return Err(RowFailure::new(format!(
                "Expected {} columns, found {}.",
                self.headers.len(),
                self.record.len()
            )));
        }

        let record = StringRecord::from_byte_record(self.record.clone())
            .map_err(|_| RowFailure::new("Row contains invalid UTF-8."))?;

        Ok(CsvRow::from_record(&self.headers, &record))
    }
}

impl<R: Read> Iterator for RowReader<R> {
    type Item = Result<ParsedRow, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Ok(true) => {
                    if is_blank(&self.record) {
                        continue;
                    }
                    let line = self
                        .record
                        .position()
                        .map_or_else(|| self.reader.position().line(), |pos| pos.line());
                    return Some(Ok((self.row_at(line), self.decode())));
                }
                Err(e) if e.is_io_error() => {
                    self.done = true;
                    return Some(Err(fatal(e)));
                }
                Err(e) => {
                    let line = e
                        .position()
                        .map_or_else(|| self.reader.position().line(), |pos| pos.line());
                    let failure = RowFailure::new(format!("Malformed CSV row: {}", e));
                    return Some(Ok((self.row_at(line), Err(failure))));
                }
            }
        }
    }
}

/// Read one record, skipping blank lines
fn read_record<R: Read>(reader: &mut csv::Reader<R>, record: &mut ByteRecord) -> Result<bool, ImportError> {
    loop {
        match reader.read_byte_record(record) {
            Ok(false) => return Ok(false),
            Ok(true) if is_blank(record) => continue,
            Ok(true) => return Ok(true),
            Err(e) => return Err(fatal(e)),
        }
    }
}

fn fatal(e: csv::Error) -> ImportError {
    if e.is_io_error() {
        ImportError::Io(e.into())
    } else {
        ImportError::Csv(e)
    }
}

/// A whitespace-only line reads as a single empty field
fn is_blank(record: &ByteRecord) -> bool {
    record.len() == 1 && record.get(0).map_or(true, |field| field.is_empty())
}

/// Input adapter that keeps every file line visible to the CSV reader.
///
/// Outside quoted fields, `\r\n` and lone `\r` become `\n` and an empty line
/// gets a single space. The reader otherwise skips empty lines while starting
/// the next record, which would credit that record with the blank line's
/// position. Quoted fields pass through untouched.
struct LineFeeds<R> {
    inner: R,
    chunk: Vec<u8>,
    ready: Vec<u8>,
    pos: usize,
    in_quotes: bool,
    field_start: bool,
    line_start: bool,
    after_cr: bool,
}

impl<R: Read> LineFeeds<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            chunk: vec![0; 8 * 1024],
            ready: Vec::new(),
            pos: 0,
            in_quotes: false,
            field_start: true,
            line_start: true,
            after_cr: false,
        }
    }

    fn push(&mut self, byte: u8) {
        if std::mem::take(&mut self.after_cr) && byte == b'\n' {
            return;
        }

        if self.in_quotes {
            if byte == b'"' {
                self.in_quotes = false;
            }
            self.ready.push(byte);
            return;
        }

        match byte {
            b'\r' | b'\n' => {
                if self.line_start {
                    self.ready.push(b' ');
                }
                self.ready.push(b'\n');
                self.line_start = true;
                self.field_start = true;
                self.after_cr = byte == b'\r';
            }
            _ => {
                if byte == b'"' && self.field_start {
                    self.in_quotes = true;
                }
                self.field_start = byte == b',';
                self.line_start = false;
                self.ready.push(byte);
            }
        }
    }
}

impl<R: Read> Read for LineFeeds<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.ready.len() {
            let n = self.inner.read(&mut self.chunk)?;
            if n == 0 {
                return Ok(0);
            }
            self.ready.clear();
            self.pos = 0;
            for i in 0..n {
                let byte = self.chunk[i];
                self.push(byte);
            }
        }

        let n = out.len().min(self.ready.len() - self.pos);
        out[..n].copy_from_slice(&self.ready[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
