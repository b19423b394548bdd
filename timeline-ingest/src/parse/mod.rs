use std::{fmt, fs::File, io::BufReader, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{error::ParseError, event::EventRecord};

pub mod csv;
pub mod json;
pub mod jsonl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    // A single top level array, read fully into memory
    Json,
    Csv,
    Jsonl,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        ext.parse().ok()
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SourceFormat::Json),
            "csv" => Ok(SourceFormat::Csv),
            "jsonl" | "ndjson" => Ok(SourceFormat::Jsonl),
            other => Err(format!("Unknown source format: {other}")),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceFormat::Json => "json",
            SourceFormat::Csv => "csv",
            SourceFormat::Jsonl => "jsonl",
        };
        f.write_str(s)
    }
}

/// What to do with a record that fails to parse or validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRecordPolicy {
    #[default]
    Abort,
    Skip,
}

impl FromStr for InvalidRecordPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(InvalidRecordPolicy::Abort),
            "skip" => Ok(InvalidRecordPolicy::Skip),
            other => Err(format!("Unknown invalid record policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub on_invalid: InvalidRecordPolicy,
    // Whole-document JSON historically skipped required field checks entirely
    pub validate_json_documents: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            on_invalid: InvalidRecordPolicy::Abort,
            validate_json_documents: true,
        }
    }
}

/// A record as the format produced it, before required field validation.
pub struct RawRecord {
    pub line: usize,
    pub fields: Map<String, Value>,
}

pub type RawRecords = Box<dyn Iterator<Item = Result<RawRecord, ParseError>> + Send>;

/// A lazy, single pass sequence of validated records. Once it has yielded an
/// error under the abort policy it yields nothing more, to retry a caller has
/// to open the file again.
pub struct RecordReader {
    inner: RawRecords,
    lenient: bool,
    on_invalid: InvalidRecordPolicy,
    skipped: usize,
    done: bool,
}

impl RecordReader {
    pub fn new(inner: RawRecords, lenient: bool, on_invalid: InvalidRecordPolicy) -> Self {
        Self {
            inner,
            lenient,
            on_invalid,
            skipped: 0,
            done: false,
        }
    }

    /// Records dropped under the skip policy so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn convert(&self, raw: RawRecord) -> Result<EventRecord, ParseError> {
        let record = if self.lenient {
            EventRecord::from_fields_lenient(raw.line, raw.fields)?
        } else {
            EventRecord::from_fields(raw.line, raw.fields)?
        };
        Ok(record)
    }
}

impl Iterator for RecordReader {
    type Item = Result<EventRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let res = match self.inner.next()? {
                Ok(raw) => self.convert(raw),
                Err(e) => Err(e),
            };

            match res {
                Ok(record) => return Some(Ok(record)),
                Err(e) if self.on_invalid == InvalidRecordPolicy::Skip && is_record_local(&e) => {
                    warn!("Skipping invalid record: {}", e);
                    metrics::counter!(crate::metrics_consts::RECORDS_SKIPPED).increment(1);
                    self.skipped += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

// Errors confined to one record. Anything else means the rest of the input
// can't be trusted, so it aborts regardless of policy.
fn is_record_local(e: &ParseError) -> bool {
    match e {
        ParseError::Validation(_) | ParseError::Json { .. } | ParseError::UnexpectedShape { .. } => {
            true
        }
        ParseError::Csv(inner) => !matches!(inner.kind(), ::csv::ErrorKind::Io(_)),
        ParseError::Io(_) => false,
    }
}

/// Opens `path` and returns a reader over its records.
pub fn open_records(
    path: &Path,
    format: SourceFormat,
    options: ParseOptions,
) -> Result<RecordReader, ParseError> {
    let file = BufReader::new(File::open(path)?);
    let (raw, lenient): (RawRecords, bool) = match format {
        SourceFormat::Csv => (Box::new(csv::CsvRecords::new(file)), false),
        SourceFormat::Jsonl => (Box::new(jsonl::JsonLines::new(file)), false),
        SourceFormat::Json => {
            warn!(
                path = %path.display(),
                "JSON array input is loaded fully into memory and does not stream, prefer JSONL for large files"
            );
            (
                Box::new(json::read_document(file)?),
                !options.validate_json_documents,
            )
        }
    };
    Ok(RecordReader::new(raw, lenient, options.on_invalid))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::error::ValidationReason;

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    const GOOD: &str = r#"{"message": "a", "timestamp": 1, "datetime": "1970-01-01T00:00:00Z", "timestamp_desc": "Time"}"#;
    const BAD: &str = r#"{"message": "b", "timestamp": 2, "timestamp_desc": "Time"}"#;

    #[test]
    fn test_format_from_path_and_str() {
        assert_eq!(
            SourceFormat::from_path(Path::new("/tmp/x.CSV")),
            Some(SourceFormat::Csv)
        );
        assert_eq!(
            SourceFormat::from_path(Path::new("x.jsonl")),
            Some(SourceFormat::Jsonl)
        );
        assert_eq!(SourceFormat::from_path(Path::new("x.plaso")), None);
        assert!("xml".parse::<SourceFormat>().is_err());
        assert_eq!(SourceFormat::Jsonl.to_string(), "jsonl");
    }

    #[test]
    fn test_abort_policy_stops_at_first_bad_record() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "events.jsonl", &format!("{GOOD}\n{BAD}\n{GOOD}\n"));

        let mut reader = open_records(&path, SourceFormat::Jsonl, ParseOptions::default()).unwrap();
        assert!(reader.next().unwrap().is_ok());
        match reader.next().unwrap() {
            Err(ParseError::Validation(e)) => {
                assert_eq!(e.line, 2);
                assert_eq!(e.field, "datetime");
                assert_eq!(e.reason, ValidationReason::Missing);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_skip_policy_counts_and_continues() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "events.jsonl",
            &format!("{GOOD}\n{BAD}\nnot json at all\n{GOOD}\n"),
        );

        let options = ParseOptions {
            on_invalid: InvalidRecordPolicy::Skip,
            ..Default::default()
        };
        let mut reader = open_records(&path, SourceFormat::Jsonl, options).unwrap();
        let records: Vec<_> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.skipped(), 2);
    }

    #[test]
    fn test_skip_policy_survives_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut bytes = format!("{GOOD}\n").into_bytes();
        bytes.extend_from_slice(b"{\"message\":\"");
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"\"}\n");
        bytes.extend_from_slice(format!("{GOOD}\n").as_bytes());
        fs::write(&path, bytes).unwrap();

        let options = ParseOptions {
            on_invalid: InvalidRecordPolicy::Skip,
            ..Default::default()
        };
        let mut reader = open_records(&path, SourceFormat::Jsonl, options).unwrap();
        let records: Vec<_> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.skipped(), 1);
    }

    #[test]
    fn test_json_validation_is_configurable() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "events.json", &format!("[{GOOD}, {BAD}]"));

        let strict = open_records(&path, SourceFormat::Json, ParseOptions::default()).unwrap();
        assert!(strict.collect::<Result<Vec<_>, _>>().is_err());

        let lenient = ParseOptions {
            validate_json_documents: false,
            ..Default::default()
        };
        let records: Vec<_> = open_records(&path, SourceFormat::Json, lenient)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].datetime, "1970-01-01T00:00:00.000002Z");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let res = open_records(
            Path::new("/definitely/not/here.csv"),
            SourceFormat::Csv,
            ParseOptions::default(),
        );
        assert!(matches!(res, Err(ParseError::Io(_))));
    }
}
