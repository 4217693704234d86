use std::path::PathBuf;

use bridge_core::error::ExtractError;
use bridge_core::model::Row;
use futures_util::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::adapter::{PkValue, SourceAdapter, SourceError};

const DEFAULT_CHUNK_BYTES: usize = 50 * 1024 * 1024;

fn record_boundary_regex() -> Regex {
    Regex::new(r"(?m)^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\] (\w+)\.(\w+):").expect("valid regex")
}

/// Treats a Laravel log file as a "table": finite, not restartable, no
/// notion of a primary key (§4.3's "Laravel-log adapter" paragraph).
pub struct LaravelLogAdapter {
    path: PathBuf,
    max_memory_bytes: usize,
}

impl LaravelLogAdapter {
    pub fn new(path: impl Into<PathBuf>, max_memory_mb: Option<u64>) -> Self {
        Self {
            path: path.into(),
            max_memory_bytes: max_memory_mb.map(|mb| (mb as usize) * 1024 * 1024).unwrap_or(DEFAULT_CHUNK_BYTES),
        }
    }
}

struct ChunkState {
    file: Option<File>,
    buffer: String,
    chunk_bytes: usize,
    batch_size: usize,
    eof: bool,
    queued: Vec<Row>,
}

fn parse_records(buffer: &str, eof: bool) -> (Vec<Row>, usize) {
    let re = record_boundary_regex();
    let matches: Vec<_> = re.captures_iter(buffer).collect();
    if matches.is_empty() {
        return (Vec::new(), 0);
    }

    let mut records = Vec::new();
    let mut consumed = 0usize;
    for i in 0..matches.len() {
        let is_last = i + 1 == matches.len();
        if is_last && !eof {
            // incomplete record: boundary is known but its end is not yet visible.
            break;
        }
        let m = &matches[i];
        let whole = m.get(0).unwrap();
        let log_date = m.get(1).unwrap().as_str().to_string();
        let environment = m.get(2).unwrap().as_str().to_string();
        let log_type = m.get(3).unwrap().as_str().to_string().to_ascii_uppercase();

        let record_end = if is_last { buffer.len() } else { matches[i + 1].get(0).unwrap().start() };
        let message = buffer[whole.end()..record_end].trim().to_string();

        records.push(vec![
            ("log_date".to_string(), serde_json::Value::String(log_date)),
            ("environment".to_string(), serde_json::Value::String(environment)),
            ("type".to_string(), serde_json::Value::String(log_type)),
            ("message".to_string(), serde_json::Value::String(message)),
        ]);
        consumed = record_end;
    }
    (records, consumed)
}

#[async_trait::async_trait]
impl SourceAdapter for LaravelLogAdapter {
    async fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), SourceError> {
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| SourceError::Conn(bridge_core::error::ConnError(e.to_string())))?;
        Ok(())
    }

    fn extract<'a>(&'a mut self, _query: &'a str, batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>> {
        let path = self.path.clone();
        let chunk_bytes = self.max_memory_bytes;
        let batch_size = batch_size.max(1) as usize;

        let open = async move {
            File::open(&path)
                .await
                .map_err(|e| SourceError::Extract(ExtractError { message: e.to_string(), sanitised_sql: None }))
        };

        stream::once(open)
            .map(move |opened| {
                let state = match opened {
                    Ok(file) => ChunkState {
                        file: Some(file),
                        buffer: String::new(),
                        chunk_bytes,
                        batch_size,
                        eof: false,
                        queued: Vec::new(),
                    },
                    Err(e) => {
                        return stream::once(async { Err(e) }).boxed();
                    }
                };
                stream::unfold(state, |mut state| async move {
                    loop {
                        if state.queued.len() >= state.batch_size {
                            let batch = state.queued.drain(..state.batch_size).collect::<Vec<_>>();
                            return Some((Ok(batch), state));
                        }
                        let (records, consumed) = parse_records(&state.buffer, state.eof);
                        if !records.is_empty() {
                            state.buffer.drain(..consumed);
                            state.queued.extend(records);
                            continue;
                        }
                        if state.eof {
                            if state.queued.is_empty() {
                                return None;
                            }
                            let batch = std::mem::take(&mut state.queued);
                            return Some((Ok(batch), state));
                        }
                        if !read_more(&mut state).await {
                            state.eof = true;
                        }
                    }
                })
                .boxed()
            })
            .flatten()
            .boxed()
    }

    async fn delete_by_pk(&mut self, _table: &str, _pk_column: &str, _values: &[PkValue]) -> Result<u64, SourceError> {
        Err(SourceError::Unsupported("laravel_log adapter has no primary key".to_string()))
    }

    async fn disconnect(&mut self) {}
}

/// Reads one more chunk into `state.buffer`, returning `false` at EOF.
async fn read_more(state: &mut ChunkState) -> bool {
    let Some(file) = state.file.as_mut() else {
        return false;
    };
    let mut buf = vec![0u8; state.chunk_bytes];
    match file.read(&mut buf).await {
        Ok(0) => false,
        Ok(n) => {
            state.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = concat!(
        "[2025-11-19 23:25:20] local.INFO: Executando SETs de sessão ClickHouse  \n",
        "[2025-11-19 23:25:20] local.INFO: Executando query ClickHouse {\"query\":\"SELECT amount\"} \n",
        "[2025-11-19 23:25:21] production.ERROR: Falha ao executar  \n",
    );

    #[tokio::test]
    async fn parses_records_from_sample_log() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(SAMPLE.as_bytes()).unwrap();

        let mut adapter = LaravelLogAdapter::new(tmp.path(), Some(1));
        let mut stream = adapter.extract("", 10);
        let mut all = Vec::new();
        while let Some(batch) = stream.next().await {
            all.extend(batch.unwrap());
        }

        assert_eq!(all.len(), 3);
        let first = &all[0];
        let environment = first.iter().find(|(k, _)| k == "environment").unwrap();
        assert_eq!(environment.1, serde_json::Value::String("local".to_string()));
        let log_type = first.iter().find(|(k, _)| k == "type").unwrap();
        assert_eq!(log_type.1, serde_json::Value::String("INFO".to_string()));
        let message = first.iter().find(|(k, _)| k == "message").unwrap();
        assert!(message.1.as_str().unwrap().contains("Executando SETs"));
    }

    #[tokio::test]
    async fn respects_small_batch_size() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(SAMPLE.as_bytes()).unwrap();

        let mut adapter = LaravelLogAdapter::new(tmp.path(), Some(1));
        let mut stream = adapter.extract("", 1);
        let mut batch_count = 0;
        while let Some(batch) = stream.next().await {
            let batch = batch.unwrap();
            assert!(batch.len() <= 1);
            batch_count += 1;
        }
        assert_eq!(batch_count, 3);
    }

    #[tokio::test]
    async fn delete_by_pk_is_unsupported() {
        let mut adapter = LaravelLogAdapter::new("/tmp/does-not-matter.log", None);
        let result = adapter.delete_by_pk("table", "id", &[PkValue::Int(1)]).await;
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }
}
