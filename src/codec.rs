use std::str::Utf8Error;
use thiserror::Error;

pub const FIELD_SEPARATOR: char = '&';

/// One device report, fields kept exactly as they arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub chip_code: String,
    pub count_in1: String,
    pub count_in2: String,
    pub count_out1: String,
    pub count_out2: String,
    pub crc: String,
    pub event: String,
    pub relay_state: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] Utf8Error),
    #[error("incomplete message: expected at least 8 fields, got {fields}")]
    Incomplete { fields: usize },
}

/// Splits an `&`-joined payload into a record. Tokens past the eighth are ignored.
pub fn decode(payload: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
    let [chip_code, count_in1, count_in2, count_out1, count_out2, crc, event, relay_state, ..] =
        fields.as_slice()
    else {
        return Err(DecodeError::Incomplete {
            fields: fields.len(),
        });
    };

    Ok(TelemetryRecord {
        chip_code: chip_code.to_string(),
        count_in1: count_in1.to_string(),
        count_in2: count_in2.to_string(),
        count_out1: count_out1.to_string(),
        count_out2: count_out2.to_string(),
        crc: crc.to_string(),
        event: event.to_string(),
        relay_state: relay_state.to_string(),
    })
}
