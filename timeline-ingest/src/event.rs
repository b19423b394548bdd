use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordValidationError;

pub const MESSAGE: &str = "message";
pub const TIMESTAMP: &str = "timestamp";
pub const DATETIME: &str = "datetime";
pub const TIMESTAMP_DESC: &str = "timestamp_desc";
pub const DATA_TYPE: &str = "data_type";

pub const REQUIRED_FIELDS: [&str; 4] = [MESSAGE, TIMESTAMP, DATETIME, TIMESTAMP_DESC];

/// The document id the datastore assigned to an event.
pub type EventId = String;

/// A forensic event. The four rendering fields are always present and typed,
/// anything else the source carried rides along in `attributes`, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub message: String,
    // Microseconds since the unix epoch
    pub timestamp: i64,
    pub datetime: String,
    pub timestamp_desc: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// An event read back out of the datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: EventId,
    pub record: EventRecord,
}

impl EventRecord {
    /// Builds a record from a loosely typed field map, failing on the first
    /// required field that is absent or cannot be coerced.
    pub fn from_fields(
        line: usize,
        mut fields: Map<String, Value>,
    ) -> Result<Self, RecordValidationError> {
        let message = take_string(line, &mut fields, MESSAGE)?
            .ok_or_else(|| RecordValidationError::missing(line, MESSAGE))?;
        let timestamp = take_timestamp(line, &mut fields)?
            .ok_or_else(|| RecordValidationError::missing(line, TIMESTAMP))?;
        let datetime = take_datetime(line, &mut fields)?
            .ok_or_else(|| RecordValidationError::missing(line, DATETIME))?;
        let timestamp_desc = take_string(line, &mut fields, TIMESTAMP_DESC)?
            .ok_or_else(|| RecordValidationError::missing(line, TIMESTAMP_DESC))?;

        Ok(Self {
            message,
            timestamp,
            datetime,
            timestamp_desc,
            attributes: fields,
        })
    }

    /// The permissive path used for whole-document JSON when validation is
    /// switched off. Time fields are derived from each other, the text fields
    /// fall back to defaults. A record with no time information at all is still
    /// rejected, since it cannot be placed on a timeline.
    pub fn from_fields_lenient(
        line: usize,
        mut fields: Map<String, Value>,
    ) -> Result<Self, RecordValidationError> {
        let message = take_string(line, &mut fields, MESSAGE)?.unwrap_or_default();
        let timestamp_desc =
            take_string(line, &mut fields, TIMESTAMP_DESC)?.unwrap_or_else(|| "Time".to_string());
        let timestamp = take_timestamp(line, &mut fields)?;
        let datetime = take_datetime(line, &mut fields)?;

        let (timestamp, datetime) = match (timestamp, datetime) {
            (Some(ts), Some(dt)) => (ts, dt),
            (Some(ts), None) => (ts, render_micros(line, ts)?),
            (None, Some(dt)) => (datetime_to_micros(line, &dt)?, dt),
            (None, None) => return Err(RecordValidationError::missing(line, TIMESTAMP)),
        };

        Ok(Self {
            message,
            timestamp,
            datetime,
            timestamp_desc,
            attributes: fields,
        })
    }

    pub fn data_type(&self) -> Option<&str> {
        self.attributes.get(DATA_TYPE).and_then(Value::as_str)
    }

    /// Reads a text-bearing field, the typed `message` or any string attribute.
    pub fn text_field(&self, field: &str) -> Option<&str> {
        match field {
            MESSAGE => Some(&self.message),
            TIMESTAMP_DESC => Some(&self.timestamp_desc),
            DATETIME => Some(&self.datetime),
            other => self.attributes.get(other).and_then(Value::as_str),
        }
    }

    /// The document sent to the datastore.
    pub fn to_document(&self, event_type: &str) -> Value {
        let mut doc = Map::with_capacity(self.attributes.len() + 5);
        doc.insert(MESSAGE.to_string(), Value::from(self.message.clone()));
        doc.insert(TIMESTAMP.to_string(), Value::from(self.timestamp));
        doc.insert(DATETIME.to_string(), Value::from(self.datetime.clone()));
        doc.insert(
            TIMESTAMP_DESC.to_string(),
            Value::from(self.timestamp_desc.clone()),
        );
        for (k, v) in &self.attributes {
            doc.insert(k.clone(), v.clone());
        }
        doc.insert(EVENT_TYPE_FIELD.to_string(), Value::from(event_type));
        Value::Object(doc)
    }

    /// Inverse of `to_document`. The event type tag is dropped.
    pub fn from_document(line: usize, doc: Value) -> Result<Self, RecordValidationError> {
        let Value::Object(mut fields) = doc else {
            return Err(RecordValidationError::malformed(
                line,
                "_source",
                "document is not an object",
            ));
        };
        fields.remove(EVENT_TYPE_FIELD);
        Self::from_fields(line, fields)
    }
}

/// The per-document tag carrying the ingestion event type.
pub const EVENT_TYPE_FIELD: &str = "__event_type";

fn take_string(
    line: usize,
    fields: &mut Map<String, Value>,
    name: &str,
) -> Result<Option<String>, RecordValidationError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        // Numbers and booleans show up in hand-written JSON, render them rather than reject
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(other) => Err(RecordValidationError::malformed(
            line,
            name,
            format!("expected a string, got {other}"),
        )),
    }
}

fn take_timestamp(
    line: usize,
    fields: &mut Map<String, Value>,
) -> Result<Option<i64>, RecordValidationError> {
    let parsed = match fields.remove(TIMESTAMP) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Some(Value::String(s)) => parse_numeric(s.trim()),
        Some(_) => None,
    };
    match parsed {
        Some(ts) => Ok(Some(ts)),
        None => Err(RecordValidationError::malformed(
            line,
            TIMESTAMP,
            "expected an integer number of microseconds",
        )),
    }
}

fn parse_numeric(s: &str) -> Option<i64> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f as i64)
}

fn take_datetime(
    line: usize,
    fields: &mut Map<String, Value>,
) -> Result<Option<String>, RecordValidationError> {
    match fields.remove(DATETIME) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => normalize_datetime(line, &s).map(Some),
        Some(other) => Err(RecordValidationError::malformed(
            line,
            DATETIME,
            format!("expected an ISO-8601 string, got {other}"),
        )),
    }
}

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Re-renders any accepted ISO-8601 variant as RFC 3339 UTC with microseconds.
pub fn normalize_datetime(line: usize, s: &str) -> Result<String, RecordValidationError> {
    parse_datetime(s)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .ok_or_else(|| {
            RecordValidationError::malformed(line, DATETIME, format!("not ISO-8601: {s}"))
        })
}

fn datetime_to_micros(line: usize, s: &str) -> Result<i64, RecordValidationError> {
    parse_datetime(s)
        .map(|dt| dt.timestamp_micros())
        .ok_or_else(|| {
            RecordValidationError::malformed(line, DATETIME, format!("not ISO-8601: {s}"))
        })
}

fn render_micros(line: usize, micros: i64) -> Result<String, RecordValidationError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .ok_or_else(|| {
            RecordValidationError::malformed(line, TIMESTAMP, "out of representable range")
        })
}
