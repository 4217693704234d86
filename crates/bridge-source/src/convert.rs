use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::{Date, PrimitiveDateTime};

/// Row conversion rules of §4.3, applied uniformly by every adapter so the
/// JSONL produced downstream is shaped the same regardless of source.
pub fn primitive_datetime_to_value(dt: PrimitiveDateTime) -> Value {
    Value::String(dt.assume_utc().format(&Rfc3339).unwrap_or_else(|_| dt.to_string()))
}

pub fn offset_datetime_to_value(dt: OffsetDateTime) -> Value {
    Value::String(dt.format(&Rfc3339).unwrap_or_else(|_| dt.to_string()))
}

pub fn date_to_value(date: Date) -> Value {
    Value::String(date.to_string())
}

/// Invalid UTF-8 sequences are dropped, not replaced with the unicode
/// replacement character, per §4.3's "with invalid sequences dropped" wording.
/// Walks `utf8_chunks` rather than `from_utf8_lossy` so a genuine U+FFFD
/// codepoint already present in valid UTF-8 data survives — only the bytes
/// that don't decode are discarded.
pub fn blob_to_value(bytes: &[u8]) -> Value {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    Value::String(text)
}
