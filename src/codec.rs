//! Lenient wire decoding for sensor readings.
//!
//! Edge devices send each metric either as a JSON number or as a string
//! containing a decimal literal (`"22.4"`). Both forms decode to the same
//! reading; unknown keys are rejected so payload typos fail loudly instead
//! of silently dropping data.

use serde_json::Value;

use crate::model::SensorReading;

const READING_FIELDS: [&str; 10] = [
    "timestamp",
    "temperature",
    "pressure",
    "humidity",
    "oxidised",
    "reduced",
    "nh3",
    "pm1",
    "pm2",
    "pm10",
];

/// Decode failure; the `Display` string is what the HTTP layer returns in
/// the 400 body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Syntax(String),
    #[error("reading must be a json object")]
    NotAnObject,
    #[error("batch must be a json array")]
    NotAnArray,
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("invalid field {name:?}: {cause}")]
    InvalidField { name: &'static str, cause: String },
    #[error("timestamp is required")]
    MissingTimestamp,
    #[error("batch must not be empty")]
    BatchEmpty,
    #[error("batch exceeds max size of {0}")]
    BatchTooLarge(usize),
    #[error("reading at index {index}: {source}")]
    AtIndex {
        index: usize,
        #[source]
        source: Box<DecodeError>,
    },
}

/// Decode a single reading from raw request bytes.
pub fn decode_reading(raw: &[u8]) -> Result<SensorReading, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Syntax(e.to_string()))?;
    decode_value(&value)
}

/// Decode a batch of readings, bounded by `max_batch_size`. Element errors
/// carry the offending index.
pub fn decode_batch(raw: &[u8], max_batch_size: usize) -> Result<Vec<SensorReading>, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Syntax(e.to_string()))?;
    let items = value.as_array().ok_or(DecodeError::NotAnArray)?;

    if items.is_empty() {
        return Err(DecodeError::BatchEmpty);
    }
    if items.len() > max_batch_size {
        return Err(DecodeError::BatchTooLarge(max_batch_size));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            decode_value(item).map_err(|e| DecodeError::AtIndex {
                index,
                source: Box::new(e),
            })
        })
        .collect()
}

fn decode_value(value: &Value) -> Result<SensorReading, DecodeError> {
    let map = value.as_object().ok_or(DecodeError::NotAnObject)?;

    for key in map.keys() {
        if !READING_FIELDS.contains(&key.as_str()) {
            return Err(DecodeError::UnknownField(key.clone()));
        }
    }

    let timestamp = int_field(map, "timestamp")?;
    if timestamp == 0 {
        return Err(DecodeError::MissingTimestamp);
    }

    Ok(SensorReading {
        timestamp,
        temperature: float_field(map, "temperature")?,
        pressure: float_field(map, "pressure")?,
        humidity: float_field(map, "humidity")?,
        oxidised: float_field(map, "oxidised")?,
        reduced: float_field(map, "reduced")?,
        nh3: float_field(map, "nh3")?,
        pm1: float_field(map, "pm1")?,
        pm2: float_field(map, "pm2")?,
        pm10: float_field(map, "pm10")?,
    })
}

fn float_field(
    map: &serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<f64, DecodeError> {
    let value = map.get(name).ok_or(DecodeError::MissingField(name))?;
    parse_float(value).map_err(|cause| DecodeError::InvalidField { name, cause })
}

fn int_field(
    map: &serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<i64, DecodeError> {
    let value = map.get(name).ok_or(DecodeError::MissingField(name))?;
    parse_int(value).map_err(|cause| DecodeError::InvalidField { name, cause })
}

fn parse_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| format!("{number} is out of range")),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<f64>()
                .map_err(|_| format!("invalid float value {trimmed:?}"))
        }
        Value::Null => Ok(0.0),
        other => Err(format!("expected a number or string, got {other}")),
    }
}

/// Integers accept float forms (`3.0`, `"3.7"`) and truncate toward zero.
fn parse_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(number) => {
            if let Some(parsed) = number.as_i64() {
                return Ok(parsed);
            }
            number
                .as_f64()
                .map(|f| f as i64)
                .ok_or_else(|| format!("{number} is out of range"))
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(parsed) = trimmed.parse::<i64>() {
                return Ok(parsed);
            }
            trimmed
                .parse::<f64>()
                .map(|f| f as i64)
                .map_err(|_| format!("invalid int value {trimmed:?}"))
        }
        Value::Null => Ok(0),
        other => Err(format!("expected a number or string, got {other}")),
    }
}
