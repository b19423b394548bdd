use std::io::BufRead;

use serde_json::Value;

use super::RawRecord;
use crate::error::ParseError;

/// One JSON object per line, parsed as it is read. Blank lines are ignored.
///
/// Lines are read as raw bytes so a line that is not valid UTF-8 is reported
/// as a bad record on that line instead of a read failure for the whole file.
pub struct JsonLines<R: BufRead> {
    input: R,
    line: usize,
    buf: Vec<u8>,
    failed: bool,
}

impl<R: BufRead> JsonLines<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            buf: Vec::new(),
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for JsonLines<R> {
    type Item = Result<RawRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed {
            self.buf.clear();
            match self.input.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let line = self.line;
            return Some(match serde_json::from_slice::<Value>(&self.buf) {
                Ok(Value::Object(fields)) => Ok(RawRecord { line, fields }),
                Ok(_) => Err(ParseError::UnexpectedShape {
                    line,
                    expected: "a JSON object",
                }),
                Err(source) => Err(ParseError::Json { line, source }),
            });
        }
        None
    }
}
