use std::io::Read;

use serde_json::Value;

use super::RawRecord;
use crate::error::ParseError;

/// Reads a whole JSON document holding a single top level array of event
/// objects. The full array is materialized before the first record is
/// returned, memory use is proportional to the file.
pub fn read_document<R: Read>(
    input: R,
) -> Result<impl Iterator<Item = Result<RawRecord, ParseError>> + Send, ParseError> {
    let doc: Value =
        serde_json::from_reader(input).map_err(|source| ParseError::Json { line: 1, source })?;

    let Value::Array(items) = doc else {
        return Err(ParseError::UnexpectedShape {
            line: 1,
            expected: "a top level JSON array",
        });
    };

    // Positions are 1-based so they read the same as line numbers in other formats
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(fields) => Ok(RawRecord {
                line: idx + 1,
                fields,
            }),
            _ => Err(ParseError::UnexpectedShape {
                line: idx + 1,
                expected: "a JSON object",
            }),
        }))
}
