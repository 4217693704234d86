use std::path::{Path, PathBuf};

use bridge_core::model::{JsonlFileInfo, Row};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::AsyncWriteExt;

/// Streams records to a single on-disk file, hashing and counting as it goes
/// so `close()` can hand back an exact `JsonlFileInfo` (§4.4).
///
/// The checksum accumulates over the pre-compression byte stream even in
/// gzip mode: §4.4 is explicit that compression must not change the digest.
pub struct JsonlWriter {
    file_path: PathBuf,
    mapping_name: String,
    schema_slug: String,
    compressed: bool,
    sink: Sink,
    hasher: blake3::Hasher,
    record_count: u64,
    raw_bytes: u64,
}

enum Sink {
    Plain(tokio::fs::File),
    Gzip(GzEncoder<Vec<u8>>, tokio::fs::File),
}

impl JsonlWriter {
    /// Opens `<dir>/<mapping_name>_<schema_slug>_<unix_seconds>[.jsonl|.jsonl.gz]`.
    pub async fn open(
        dir: &Path,
        mapping_name: &str,
        schema_slug: &str,
        unix_seconds: i64,
        compressed: bool,
    ) -> Result<Self, anyhow::Error> {
        Self::open_named(
            dir,
            &format!("{mapping_name}_{schema_slug}_{unix_seconds}"),
            mapping_name,
            schema_slug,
            compressed,
        )
        .await
    }

    /// Like `open`, but takes the file stem verbatim — used by `JsonlBatchWriter`
    /// to append the `_part<NNN>` suffix (§4.4).
    pub async fn open_named(
        dir: &Path,
        stem: &str,
        mapping_name: &str,
        schema_slug: &str,
        compressed: bool,
    ) -> Result<Self, anyhow::Error> {
        tokio::fs::create_dir_all(dir).await?;
        let ext = if compressed { "jsonl.gz" } else { "jsonl" };
        let file_path = dir.join(format!("{stem}.{ext}"));
        let file = tokio::fs::File::create(&file_path).await?;
        let sink = if compressed {
            Sink::Gzip(GzEncoder::new(Vec::new(), Compression::default()), file)
        } else {
            Sink::Plain(file)
        };
        Ok(Self {
            file_path,
            mapping_name: mapping_name.to_string(),
            schema_slug: schema_slug.to_string(),
            compressed,
            sink,
            hasher: blake3::Hasher::new(),
            record_count: 0,
            raw_bytes: 0,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Compact JSON (no extra whitespace), newline-terminated, non-ASCII preserved.
    pub async fn write_record(&mut self, record: &Row) -> Result<(), anyhow::Error> {
        let mut line = serde_json::to_vec(&row_to_json(record))?;
        line.push(b'\n');
        self.hasher.update(&line);
        self.raw_bytes += line.len() as u64;
        match &mut self.sink {
            Sink::Plain(file) => file.write_all(&line).await?,
            Sink::Gzip(encoder, _) => {
                use std::io::Write as _;
                encoder.write_all(&line)?;
            }
        }
        self.record_count += 1;
        Ok(())
    }

    pub async fn write_batch(&mut self, records: &[Row]) -> Result<(), anyhow::Error> {
        for record in records {
            self.write_record(record).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), anyhow::Error> {
        match &mut self.sink {
            Sink::Plain(file) => file.flush().await?,
            Sink::Gzip(encoder, file) => {
                // `flush()` on a `GzEncoder<Vec<u8>>` only flushes the in-memory buffer, not
                // the gzip stream itself; we drain whatever is buffered to the underlying file
                // without finishing the stream, so more records can still follow.
                use std::io::Write as _;
                encoder.flush()?;
                let pending = std::mem::take(encoder.get_mut());
                if !pending.is_empty() {
                    file.write_all(&pending).await?;
                }
                file.flush().await?;
            }
        }
        Ok(())
    }

    /// Finalises the file: flushes the gzip trailer (if any) and returns the
    /// descriptor. A file is "finalised" only once this completes (§4.4).
    pub async fn close(mut self, created_at: &str) -> Result<JsonlFileInfo, anyhow::Error> {
        match self.sink {
            Sink::Plain(mut file) => {
                file.flush().await?;
                file.sync_all().await?;
            }
            Sink::Gzip(encoder, mut file) => {
                let tail = encoder.finish()?;
                if !tail.is_empty() {
                    file.write_all(&tail).await?;
                }
                file.flush().await?;
                file.sync_all().await?;
            }
        }
        let file_size = tokio::fs::metadata(&self.file_path).await?.len();
        let checksum = self.hasher.finalize().to_hex().to_string();
        Ok(JsonlFileInfo {
            file_path: self.file_path.to_string_lossy().to_string(),
            record_count: self.record_count,
            file_size,
            compressed: self.compressed,
            checksum,
            created_at: created_at.to_string(),
            mapping_name: self.mapping_name,
            schema_slug: self.schema_slug,
        })
    }
}

fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(row.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str) -> Row {
        vec![
            ("id".to_string(), serde_json::Value::from(id)),
            ("name".to_string(), serde_json::Value::String(name.to_string())),
        ]
    }

    #[tokio::test]
    async fn write_then_close_reports_exact_counts() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let mut writer = JsonlWriter::open(tmp.path(), "mydb.users", "users", 1_700_000_000, false).await?;
        writer.write_record(&row(1, "a")).await?;
        writer.write_record(&row(2, "b")).await?;
        let info = writer.close("2024-01-01T00:00:00Z").await?;

        assert_eq!(info.record_count, 2);
        let on_disk = tokio::fs::metadata(&info.file_path).await?.len();
        assert_eq!(on_disk, info.file_size);
        let contents = tokio::fs::read_to_string(&info.file_path).await?;
        assert_eq!(contents, "{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\"}\n");
        Ok(())
    }

    #[tokio::test]
    async fn filename_follows_naming_convention() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let writer = JsonlWriter::open(tmp.path(), "mydb.users", "users", 1_700_000_000, false).await?;
        assert_eq!(
            writer.file_path().file_name().unwrap().to_str().unwrap(),
            "mydb.users_users_1700000000.jsonl"
        );
        Ok(())
    }

    #[tokio::test]
    async fn gzip_mode_checksums_the_precompression_bytes() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let mut plain = JsonlWriter::open(tmp.path(), "mydb.users", "users", 1, false).await?;
        plain.write_record(&row(1, "a")).await?;
        let plain_info = plain.close("t").await?;

        let mut gz = JsonlWriter::open(tmp.path(), "mydb.users", "users", 2, true).await?;
        gz.write_record(&row(1, "a")).await?;
        let gz_info = gz.close("t").await?;

        assert_eq!(plain_info.checksum, gz_info.checksum);
        assert!(gz_info.compressed);
        assert!(gz_info.file_path.ends_with(".jsonl.gz"));
        Ok(())
    }

    #[tokio::test]
    async fn record_count_and_file_size_are_exact_on_disk_state() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let mut writer = JsonlWriter::open(tmp.path(), "mydb.users", "users", 1, false).await?;
        for i in 0..50 {
            writer.write_record(&row(i, "x")).await?;
        }
        let info = writer.close("t").await?;
        let on_disk = tokio::fs::metadata(&info.file_path).await?.len();
        assert_eq!(info.file_size, on_disk);
        assert_eq!(info.record_count, 50);
        Ok(())
    }
}
