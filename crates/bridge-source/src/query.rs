use bridge_core::error::ConfigError;
use bridge_core::model::{IncrementalMode, MappingConfig, SourceType};

/// Identifier quoting differs by dialect; `build_sql_query` in the source this
/// was ported from only ever backtick-quoted, because it only ever targeted MySQL.
pub fn quote_ident(kind: SourceType, ident: &str) -> String {
    match kind {
        SourceType::Mysql => format!("`{ident}`"),
        SourceType::Postgresql | SourceType::Sqlserver | SourceType::Sqlite => format!("\"{ident}\""),
        SourceType::LaravelLog => ident.to_string(),
    }
}

/// Normalises the user-supplied `order_by` field: a bare column name gets
/// quoted and `ASC` appended; a clause already starting with `order by` is
/// used as-is, with a trailing semicolon stripped.
fn normalise_order_by(kind: SourceType, order_by: &str) -> String {
    let trimmed = order_by.trim().trim_end_matches(';').trim();
    if trimmed.to_ascii_lowercase().starts_with("order by") {
        trimmed.to_string()
    } else {
        format!("ORDER BY {} ASC", quote_ident(kind, trimmed))
    }
}

/// Builds the SELECT for the four `incremental_mode` branches of §4.3.
/// Returns `cfg.query` verbatim when present, else errors for `custom_sql`
/// without one.
pub fn build_query(cfg: &MappingConfig) -> Result<String, ConfigError> {
    if let Some(query) = &cfg.query {
        return Ok(query.clone());
    }

    let kind = cfg.source.kind;
    let table = quote_ident(kind, &cfg.table);

    match cfg.transfer.incremental_mode {
        IncrementalMode::Full => {
            let mut query = format!("SELECT * FROM {table}");
            if let Some(order_by) = &cfg.transfer.order_by {
                query.push(' ');
                query.push_str(&normalise_order_by(kind, order_by));
            }
            Ok(query)
        }
        IncrementalMode::IncrementalPk => {
            let pk_column = cfg.transfer.pk_column.as_ref().ok_or_else(|| ConfigError::MissingField {
                mapping: cfg.mapping_name(),
                field: "transfer.pk_column",
            })?;
            let pk = quote_ident(kind, pk_column);
            let mut query = format!(
                "SELECT * FROM {table} WHERE {pk} > {}",
                cfg.transfer.initial_watermark
            );
            query.push(' ');
            match &cfg.transfer.order_by {
                Some(order_by) => query.push_str(&normalise_order_by(kind, order_by)),
                None => query.push_str(&format!("ORDER BY {pk} ASC")),
            }
            Ok(query)
        }
        IncrementalMode::IncrementalTimestamp => {
            let ts_column = cfg.transfer.timestamp_column.as_ref().ok_or_else(|| ConfigError::MissingField {
                mapping: cfg.mapping_name(),
                field: "transfer.timestamp_column",
            })?;
            let ts = quote_ident(kind, ts_column);
            let mut query = format!(
                "SELECT * FROM {table} WHERE {ts} > '{}'",
                cfg.transfer.initial_watermark
            );
            query.push(' ');
            match &cfg.transfer.order_by {
                Some(order_by) => query.push_str(&normalise_order_by(kind, order_by)),
                None => query.push_str(&format!("ORDER BY {ts} ASC")),
            }
            Ok(query)
        }
        IncrementalMode::CustomSql => Err(ConfigError::MissingField {
            mapping: cfg.mapping_name(),
            field: "query",
        }),
    }
}
