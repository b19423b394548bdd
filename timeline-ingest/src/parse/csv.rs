use std::io::Read;

use serde_json::{Map, Value};

use super::RawRecord;
use crate::error::ParseError;

/// Streams rows of a headed CSV file. Every cell stays a string, required
/// fields are coerced later by `EventRecord::from_fields`.
pub struct CsvRecords<R: Read> {
    reader: ::csv::Reader<R>,
    headers: Option<Vec<String>>,
    row: ::csv::StringRecord,
    failed: bool,
}

impl<R: Read> CsvRecords<R> {
    pub fn new(input: R) -> Self {
        let reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(::csv::Trim::Headers)
            .from_reader(input);
        Self {
            reader,
            headers: None,
            row: ::csv::StringRecord::new(),
            failed: false,
        }
    }

    fn headers(&mut self) -> Result<&[String], ParseError> {
        if self.headers.is_none() {
            let headers: Vec<String> = self
                .reader
                .headers()?
                .iter()
                .map(|h| h.trim_start_matches('\u{feff}').to_string())
                .collect();
            self.headers = Some(headers);
        }
        Ok(self.headers.as_deref().unwrap_or_default())
    }
}

impl<R: Read> Iterator for CsvRecords<R> {
    type Item = Result<RawRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.headers() {
            self.failed = true;
            return Some(Err(e));
        }

        match self.reader.read_record(&mut self.row) {
            Ok(false) => None,
            Ok(true) => {
                let line = self
                    .row
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or_default();
                let headers = self.headers.as_deref().unwrap_or_default();
                let mut fields = Map::with_capacity(headers.len());
                for (name, value) in headers.iter().zip(self.row.iter()) {
                    if name.is_empty() {
                        continue;
                    }
                    fields.insert(name.clone(), Value::String(value.to_string()));
                }
                Some(Ok(RawRecord { line, fields }))
            }
            Err(e) => {
                // An I/O failure leaves the reader in an unknown state, a bad row doesn't
                if matches!(e.kind(), ::csv::ErrorKind::Io(_)) {
                    self.failed = true;
                }
                Some(Err(e.into()))
            }
        }
    }
}
