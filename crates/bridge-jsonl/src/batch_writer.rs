use std::path::PathBuf;

use bridge_core::clock::Clock;
use bridge_core::model::{JsonlFileInfo, Row};
use std::sync::Arc;

use crate::writer::JsonlWriter;

/// Rotates across files when either threshold is hit, suffixing the mapping
/// name with a zero-padded `_part<NNN>` (§4.4). The current record always
/// finishes in the current file before a size-triggered rotation — only the
/// *next* record lands in the new one.
pub struct JsonlBatchWriter {
    dir: PathBuf,
    mapping_name: String,
    schema_slug: String,
    unix_seconds: i64,
    compressed: bool,
    max_file_size: u64,
    max_records_per_file: u64,
    clock: Arc<dyn Clock>,
    part: u32,
    current: Option<JsonlWriter>,
    current_bytes: u64,
    current_records: u64,
    finished: Vec<JsonlFileInfo>,
}

impl JsonlBatchWriter {
    pub fn new(
        dir: PathBuf,
        mapping_name: impl Into<String>,
        schema_slug: impl Into<String>,
        clock: Arc<dyn Clock>,
        max_file_size: u64,
        max_records_per_file: u64,
        compressed: bool,
    ) -> Self {
        let unix_seconds = clock.now_unix();
        Self {
            dir,
            mapping_name: mapping_name.into(),
            schema_slug: schema_slug.into(),
            unix_seconds,
            compressed,
            max_file_size,
            max_records_per_file,
            clock,
            part: 1,
            current: None,
            current_bytes: 0,
            current_records: 0,
            finished: Vec::new(),
        }
    }

    fn part_stem(&self) -> String {
        format!(
            "{}_part{:03}_{}_{}",
            self.mapping_name, self.part, self.schema_slug, self.unix_seconds
        )
    }

    async fn ensure_open(&mut self) -> Result<(), anyhow::Error> {
        if self.current.is_none() {
            let stem = self.part_stem();
            let writer =
                JsonlWriter::open_named(&self.dir, &stem, &self.mapping_name, &self.schema_slug, self.compressed)
                    .await?;
            self.current = Some(writer);
            self.current_bytes = 0;
            self.current_records = 0;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), anyhow::Error> {
        if let Some(writer) = self.current.take() {
            let created_at = self.clock.now_rfc3339();
            let info = writer.close(&created_at).await?;
            self.finished.push(info);
        }
        self.part += 1;
        self.current_bytes = 0;
        self.current_records = 0;
        Ok(())
    }

    /// Estimates a record's serialised size (JSON body + newline) to decide
    /// whether writing it would cross `max_file_size`; the estimate only
    /// gates *future* writes, it is never substituted for the writer's own
    /// exact byte count in the returned `JsonlFileInfo`.
    fn estimated_len(record: &Row) -> u64 {
        let obj = serde_json::Value::Object(record.iter().cloned().collect());
        serde_json::to_vec(&obj).map(|v| v.len() as u64 + 1).unwrap_or(1)
    }

    pub async fn write_record(&mut self, record: &Row) -> Result<(), anyhow::Error> {
        self.ensure_open().await?;
        let would_exceed_size = self.max_file_size > 0
            && self.current_records > 0
            && self.current_bytes + Self::estimated_len(record) > self.max_file_size;
        let would_exceed_count =
            self.max_records_per_file > 0 && self.current_records >= self.max_records_per_file;
        if would_exceed_size || would_exceed_count {
            self.rotate().await?;
            self.ensure_open().await?;
        }

        let writer = self.current.as_mut().expect("ensure_open populates current");
        writer.write_record(record).await?;
        self.current_records += 1;
        self.current_bytes += Self::estimated_len(record);
        Ok(())
    }

    pub async fn write_batch(&mut self, records: &[Row]) -> Result<(), anyhow::Error> {
        for record in records {
            self.write_record(record).await?;
        }
        Ok(())
    }

    /// Finalises the partially-filled current file (if any) and returns the
    /// ordered list of every file written, in part order.
    pub async fn close(mut self) -> Result<Vec<JsonlFileInfo>, anyhow::Error> {
        if let Some(writer) = self.current.take() {
            let created_at = self.clock.now_rfc3339();
            let info = writer.close(&created_at).await?;
            self.finished.push(info);
        }
        Ok(self.finished)
    }
}
