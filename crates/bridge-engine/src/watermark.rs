use bridge_core::model::Row;
use bridge_source::PkValue;

/// `true` if `candidate` sorts after `current` under the natural order of the
/// watermark column's type: numeric comparison for JSON numbers, lexical
/// comparison otherwise (safe for RFC-3339 timestamps, which are
/// lexically ordered by construction — §4.3's row conversion already
/// normalises datetimes to that form).
fn greater(candidate: &serde_json::Value, current: &serde_json::Value) -> bool {
    match (candidate, current) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::MIN) > b.as_f64().unwrap_or(f64::MIN)
        }
        _ => stringify(candidate) > stringify(current),
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Running `max(column)` over a row stream, kept instead of the full row set
/// so the runner never holds more than one watermark candidate in memory
/// (§9's stream-through rearchitecture). Rows missing the column, or with a
/// null value for it, are skipped.
pub struct WatermarkTracker<'a> {
    column: Option<&'a str>,
    max: Option<serde_json::Value>,
}

impl<'a> WatermarkTracker<'a> {
    pub fn new(column: Option<&'a str>) -> Self {
        Self { column, max: None }
    }

    pub fn observe(&mut self, row: &Row) {
        let Some(column) = self.column else { return };
        let Some((_, value)) = row.iter().find(|(name, _)| name == column) else {
            return;
        };
        if value.is_null() {
            return;
        }
        match &self.max {
            Some(current) if !greater(value, current) => {}
            _ => self.max = Some(value.clone()),
        }
    }

    pub fn finish(self) -> Option<String> {
        self.max.as_ref().map(stringify)
    }
}

/// Converts a single row's `pk_column` cell to a [`PkValue`], for the
/// post-upload `delete_by_pk` step (§4.1 step 5), accumulated one row at a
/// time as rows stream past rather than re-derived from a buffered `Vec`.
pub fn pk_value_of(row: &Row, pk_column: &str) -> Option<PkValue> {
    row.iter().find(|(name, _)| name == pk_column).map(|(_, value)| match value {
        serde_json::Value::Number(n) if n.is_i64() => PkValue::Int(n.as_i64().unwrap()),
        serde_json::Value::Number(n) => PkValue::Text(n.to_string()),
        serde_json::Value::String(s) => PkValue::Text(s.clone()),
        other => PkValue::Text(other.to_string()),
    })
}
