use bridge_core::error::{ConnError, ExtractError};
use bridge_core::model::Row;
use futures_util::stream::{self, BoxStream, StreamExt};
use tiberius::{Client, ColumnType, Config, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::adapter::{PkValue, SourceAdapter, SourceError};
use crate::convert::{blob_to_value, primitive_datetime_to_value};

type TiberiusClient = Client<Compat<TcpStream>>;

pub struct SqlServerAdapter {
    connection_string: String,
    client: Option<TiberiusClient>,
}

impl SqlServerAdapter {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: None,
        }
    }
}

fn tiberius_row_to_record(row: tiberius::Row) -> Result<Row, SourceError> {
    let mut record = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = match column.column_type() {
            ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8 | ColumnType::Intn => row
                .try_get::<i64, _>(idx)
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            ColumnType::Float4 | ColumnType::Float8 | ColumnType::Floatn | ColumnType::Money | ColumnType::Money4 => row
                .try_get::<f64, _>(idx)
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            ColumnType::Bit | ColumnType::Bitn => row
                .try_get::<bool, _>(idx)
                .map_err(extract_error)?
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen | ColumnType::Daten => row
                .try_get::<time::PrimitiveDateTime, _>(idx)
                .map_err(extract_error)?
                .map(primitive_datetime_to_value)
                .unwrap_or(serde_json::Value::Null),
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
                .try_get::<&[u8], _>(idx)
                .map_err(extract_error)?
                .map(blob_to_value)
                .unwrap_or(serde_json::Value::Null),
            _ => row
                .try_get::<&str, _>(idx)
                .map_err(extract_error)?
                .map(|s| serde_json::Value::String(s.to_string()))
                .unwrap_or(serde_json::Value::Null),
        };
        record.push((name, value));
    }
    Ok(record)
}

fn extract_error(e: tiberius::error::Error) -> SourceError {
    SourceError::Extract(ExtractError {
        message: e.to_string(),
        sanitised_sql: None,
    })
}

#[async_trait::async_trait]
impl SourceAdapter for SqlServerAdapter {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let config = Config::from_ado_string(&self.connection_string)
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        tcp.set_nodelay(true).map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        self.client = Some(client);
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), SourceError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SourceError::Conn(ConnError("sqlserver adapter not connected".to_string())))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?
            .into_results()
            .await
            .map_err(|e| SourceError::Conn(ConnError(e.to_string())))?;
        Ok(())
    }

    fn extract<'a>(&'a mut self, query: &'a str, batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>> {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => {
                return stream::once(async {
                    Err(SourceError::Conn(ConnError("sqlserver adapter not connected".to_string())))
                })
                .boxed();
            }
        };
        let batch_size = batch_size.max(1) as usize;
        let fut = async move {
            client
                .simple_query(query)
                .await
                .map_err(|e| SourceError::Conn(ConnError(e.to_string())))
                .map(|stream| stream.into_row_stream())
        };
        stream::once(fut)
            .map(|result| match result {
                Ok(rows) => rows.map(|row_result| row_result.map_err(extract_error).and_then(tiberius_row_to_record)).boxed(),
                Err(e) => stream::once(async { Err(e) }).boxed(),
            })
            .flatten()
            .chunks(batch_size)
            .map(|chunk| chunk.into_iter().collect::<Result<Vec<Row>, SourceError>>())
            .boxed()
    }

    async fn delete_by_pk(&mut self, table: &str, pk_column: &str, values: &[PkValue]) -> Result<u64, SourceError> {
        if values.is_empty() {
            return Ok(0);
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SourceError::Conn(ConnError("sqlserver adapter not connected".to_string())))?;
        let mut deleted = 0u64;
        for chunk in values.chunks(1000) {
            let placeholders = (1..=chunk.len()).map(|i| format!("@P{i}")).collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM \"{table}\" WHERE \"{pk_column}\" IN ({placeholders})");
            let params: Vec<&dyn ToSql> = chunk
                .iter()
                .map(|v| match v {
                    PkValue::Int(i) => i as &dyn ToSql,
                    PkValue::Text(s) => s as &dyn ToSql,
                })
                .collect();
            let result = client.execute(sql.as_str(), &params).await.map_err(|e| {
                SourceError::Extract(ExtractError {
                    message: e.to_string(),
                    sanitised_sql: Some(sql.clone()),
                })
            })?;
            deleted += result.total();
        }
        Ok(deleted)
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }
}
