//! Timestamped data samples: the values that flow through the hub.

use std::cell::Cell;
use std::rc::Rc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::json::{self, JsonType};

/// Timestamp sentinel: stamp the sample from the wall clock at construction.
pub const NOW: f64 = 0.0;

/// The semantic type of a sample.
///
/// Samples don't record this themselves: String and Json values share one
/// representation, and which one a sample *is* belongs to the resource it
/// flows through. Samples appear far more frequently than resources, so the
/// byte saved here matters on small devices.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataType {
    Trigger,
    Boolean,
    Numeric,
    String,
    Json,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Trigger => "trigger",
            DataType::Boolean => "Boolean",
            DataType::Numeric => "numeric",
            DataType::String => "string",
            DataType::Json => "JSON",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Trigger,
    Boolean(bool),
    Numeric(f64),
    /// String *and* JSON values; see [`DataType`].
    Text(String),
}

/// One timestamped value. Immutable except for the timestamp.
#[derive(Debug)]
pub struct Sample {
    /// Seconds since the epoch.
    timestamp: Cell<f64>,
    payload: Payload,
}

/// Samples are shared; the last drop frees any text payload.
///
/// Plain `Rc`, not `Arc`: everything in the hub runs on one event loop and
/// the reference counts are deliberately non-atomic.
pub type SampleRef = Rc<Sample>;

pub(crate) fn wall_clock_seconds() -> f64 {
    let now = jiff::Timestamp::now();
    now.as_second() as f64 + f64::from(now.subsec_nanosecond()) / 1e9
}

fn resolve(timestamp: f64) -> f64 {
    if timestamp == NOW {
        wall_clock_seconds()
    } else {
        timestamp
    }
}

impl Sample {
    /// A new Trigger sample.
    pub fn trigger(timestamp: f64) -> SampleRef {
        Rc::new(Sample {
            timestamp: Cell::new(resolve(timestamp)),
            payload: Payload::Trigger,
        })
    }

    /// A new Boolean sample.
    pub fn boolean(timestamp: f64, value: bool) -> SampleRef {
        Rc::new(Sample {
            timestamp: Cell::new(resolve(timestamp)),
            payload: Payload::Boolean(value),
        })
    }

    /// A new numeric sample.
    pub fn numeric(timestamp: f64, value: f64) -> SampleRef {
        Rc::new(Sample {
            timestamp: Cell::new(resolve(timestamp)),
            payload: Payload::Numeric(value),
        })
    }

    /// A new string sample. Copies the value.
    pub fn string(timestamp: f64, value: &str) -> SampleRef {
        Rc::new(Sample {
            timestamp: Cell::new(resolve(timestamp)),
            payload: Payload::Text(value.to_owned()),
        })
    }

    /// A new JSON sample. Copies the value.
    pub fn json(timestamp: f64, value: &str) -> SampleRef {
        // JSON values are stored the same way strings are.
        Self::string(timestamp, value)
    }

    /// A copy of this sample's value under a different timestamp.
    pub(crate) fn with_timestamp(&self, timestamp: f64) -> SampleRef {
        Rc::new(Sample {
            timestamp: Cell::new(resolve(timestamp)),
            payload: self.payload.clone(),
        })
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp.get()
    }

    /// The one mutator.
    pub fn set_timestamp(&self, timestamp: f64) {
        self.timestamp.set(timestamp);
    }

    // Convenience accessors for when we know the type already.

    #[inline]
    pub fn as_bool(&self) -> bool {
        match self.payload {
            Payload::Boolean(b) => b,
            _ => panic!("Expected a Boolean sample"),
        }
    }

    #[inline]
    pub fn as_numeric(&self) -> f64 {
        match self.payload {
            Payload::Numeric(n) => n,
            _ => panic!("Expected a numeric sample"),
        }
    }

    #[inline]
    pub fn as_string(&self) -> &str {
        match &self.payload {
            Payload::Text(s) => s,
            _ => panic!("Expected a string sample"),
        }
    }

    #[inline]
    pub fn as_json(&self) -> &str {
        // Same representation as strings.
        self.as_string()
    }

    /// Render the sample as a printable string into `buf`.
    ///
    /// String samples copy their bytes verbatim; everything else renders as
    /// JSON. Returns the number of bytes written.
    pub fn convert_to_string(&self, data_type: DataType, buf: &mut [u8]) -> Result<usize> {
        if data_type == DataType::String {
            copy_bytes(buf, self.as_string().as_bytes())
        } else {
            self.convert_to_json(data_type, buf)
        }
    }

    /// Render the sample as JSON into `buf`. Returns the number of bytes
    /// written.
    ///
    /// Numbers use Rust's shortest round-trip formatting (locale
    /// independent). String samples are wrapped in double quotes with *no*
    /// escaping: a payload containing `"`, `\`, or control characters
    /// produces invalid JSON. Callers feeding strict-JSON consumers must
    /// escape upstream.
    pub fn convert_to_json(&self, data_type: DataType, buf: &mut [u8]) -> Result<usize> {
        match data_type {
            DataType::Trigger => copy_bytes(buf, b"null"),
            DataType::Boolean => {
                copy_bytes(buf, if self.as_bool() { b"true" } else { b"false" })
            }
            DataType::Numeric => copy_bytes(buf, self.as_numeric().to_string().as_bytes()),
            DataType::String => {
                let payload = self.as_string().as_bytes();
                // Two quotes plus the payload have to fit.
                if buf.len() < payload.len() + 2 {
                    return Err(Error::Overflow);
                }
                buf[0] = b'"';
                buf[1..1 + payload.len()].copy_from_slice(payload);
                buf[1 + payload.len()] = b'"';
                Ok(payload.len() + 2)
            }
            DataType::Json => copy_bytes(buf, self.as_json().as_bytes()),
        }
    }

    /// Extract an object member or array element from a JSON sample.
    ///
    /// The extracted value becomes a fresh sample typed by what was found
    /// (`null` → Trigger, `true`/`false` → Boolean, number → numeric,
    /// string → string, object/array → JSON), with this sample's timestamp.
    /// Any failure (malformed spec, non-JSON payload, missing node)
    /// returns `None`.
    pub fn extract_json(&self, spec: &str) -> Option<(DataType, SampleRef)> {
        let (value, json_type) = match json::extract(self.as_json(), spec) {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    "Failed to extract '{spec}' from JSON '{}': {err}",
                    self.as_json()
                );
                return None;
            }
        };

        let timestamp = self.timestamp();
        Some(match json_type {
            JsonType::Null => (DataType::Trigger, Sample::trigger(timestamp)),
            JsonType::Boolean => (
                DataType::Boolean,
                Sample::boolean(timestamp, json::convert_to_bool(&value)),
            ),
            JsonType::Number => (
                DataType::Numeric,
                Sample::numeric(timestamp, json::convert_to_number(&value)),
            ),
            JsonType::String => (
                DataType::String,
                Sample::string(timestamp, value.as_str().unwrap()),
            ),
            JsonType::Object | JsonType::Array => {
                (DataType::Json, Sample::json(timestamp, &value.to_string()))
            }
        })
    }
}

fn copy_bytes(dst: &mut [u8], src: &[u8]) -> Result<usize> {
    if src.len() > dst.len() {
        return Err(Error::Overflow);
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}
