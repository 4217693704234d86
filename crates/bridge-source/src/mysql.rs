use bridge_core::error::{ConnError, ExtractError};
use bridge_core::model::Row;
use futures_util::stream::{self, BoxStream, StreamExt};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row as SqlxRow, TypeInfo};

use crate::adapter::{PkValue, SourceAdapter, SourceError};
use crate::convert::{blob_to_value, date_to_value, primitive_datetime_to_value};

pub struct MysqlAdapter {
    connection_string: String,
    pool: Option<MySqlPool>,
}

impl MysqlAdapter {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pool: None,
        }
    }

    fn pool(&self) -> Result<&MySqlPool, SourceError> {
        self.pool
            .as_ref()
            .ok_or_else(|| SourceError::Conn(ConnError("mysql adapter not connected".to_string())))
    }
}

fn extract_error(e: sqlx::Error) -> SourceError {
    SourceError::Extract(ExtractError {
        message: e.to_string(),
        sanitised_sql: None,
    })
}

fn row_to_record(row: MySqlRow) -> Result<Row, SourceError> {
    let mut record = Vec::with_capacity(row.columns().len());
    for column in row.columns() {
        let name = column.name().to_string();
        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
                .try_get::<Option<i64>, _>(name.as_str())
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            "FLOAT" | "DOUBLE" | "DECIMAL" | "NEWDECIMAL" => row
                .try_get::<Option<f64>, _>(name.as_str())
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            "BOOLEAN" | "BOOL" => row
                .try_get::<Option<bool>, _>(name.as_str())
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            "DATETIME" | "TIMESTAMP" => row
                .try_get::<Option<time::PrimitiveDateTime>, _>(name.as_str())
                .map_err(extract_error)?
                .map(primitive_datetime_to_value)
                .unwrap_or(serde_json::Value::Null),
            "DATE" => row
                .try_get::<Option<time::Date>, _>(name.as_str())
                .map_err(extract_error)?
                .map(date_to_value)
                .unwrap_or(serde_json::Value::Null),
            "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => row
                .try_get::<Option<Vec<u8>>, _>(name.as_str())
                .map_err(extract_error)?
                .map(|bytes| blob_to_value(&bytes))
                .unwrap_or(serde_json::Value::Null),
            _ => row
                .try_get::<Option<String>, _>(name.as_str())
                .map_err(extract_error)?
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        };
        record.push((name, value));
    }
    Ok(record)
}

struct PageState {
    pool: MySqlPool,
    query: String,
    offset: i64,
    batch_size: i64,
    done: bool,
}

#[async_trait::async_trait]
impl SourceAdapter for MysqlAdapter {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&self.connection_string)
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1")
            .execute(self.pool()?)
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        Ok(())
    }

    /// Pages the caller's query with a `LIMIT/OFFSET` wrapper rather than
    /// keeping a live cursor open, so no borrow of the pool needs to survive
    /// across `.await` yield points in the returned stream.
    fn extract<'a>(&'a mut self, query: &'a str, batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>> {
        let pool = match self.pool.clone() {
            Some(pool) => pool,
            None => {
                return stream::once(async {
                    Err(SourceError::Conn(ConnError("mysql adapter not connected".to_string())))
                })
                .boxed();
            }
        };
        let state = PageState {
            pool,
            query: query.to_string(),
            offset: 0,
            batch_size: batch_size.max(1) as i64,
            done: false,
        };
        stream::unfold(state, move |mut state| async move {
            if state.done {
                return None;
            }
            let paged = format!(
                "SELECT * FROM ({}) AS page LIMIT {} OFFSET {}",
                state.query, state.batch_size, state.offset
            );
            match sqlx::query(&paged).fetch_all(&state.pool).await {
                Ok(rows) => {
                    let fetched = rows.len() as i64;
                    state.offset += state.batch_size;
                    if fetched < state.batch_size {
                        state.done = true;
                    }
                    if rows.is_empty() {
                        return None;
                    }
                    let batch = rows.into_iter().map(row_to_record).collect::<Result<Vec<Row>, SourceError>>();
                    Some((batch, state))
                }
                Err(e) => {
                    state.done = true;
                    Some((
                        Err(SourceError::Extract(ExtractError {
                            message: e.to_string(),
                            sanitised_sql: Some(paged),
                        })),
                        state,
                    ))
                }
            }
        })
        .boxed()
    }

    async fn delete_by_pk(&mut self, table: &str, pk_column: &str, values: &[PkValue]) -> Result<u64, SourceError> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0u64;
        for chunk in values.chunks(1000) {
            let placeholders = std::iter::repeat("?").take(chunk.len()).collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM `{table}` WHERE `{pk_column}` IN ({placeholders})");
            let mut q = sqlx::query(&sql);
            for value in chunk {
                q = match value {
                    PkValue::Int(v) => q.bind(*v),
                    PkValue::Text(v) => q.bind(v.clone()),
                };
            }
            let result = q.execute(self.pool()?).await.map_err(|e| {
                SourceError::Extract(ExtractError {
                    message: e.to_string(),
                    sanitised_sql: Some(sql.clone()),
                })
            })?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}
