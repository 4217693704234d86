use bridge_core::model::{MappingConfig, SourceType};

use crate::adapter::SourceAdapter;
use crate::laravel_log::LaravelLogAdapter;
use crate::mysql::MysqlAdapter;
use crate::postgres::PostgresAdapter;
use crate::sqlite_adapter::SqliteAdapter;
use crate::sqlserver::SqlServerAdapter;

/// Builds the adapter named by `mapping.source.type`. `connection_string` is
/// whatever the (out-of-scope, §1) credential store resolved `connection_ref`
/// to; for `laravel_log` it is the log file path instead.
pub struct SourceAdapterFactory;

impl SourceAdapterFactory {
    pub fn create(cfg: &MappingConfig, connection_string: &str) -> Box<dyn SourceAdapter> {
        match cfg.source.kind {
            SourceType::Mysql => Box::new(MysqlAdapter::new(connection_string)),
            SourceType::Postgresql => Box::new(PostgresAdapter::new(connection_string)),
            SourceType::Sqlserver => Box::new(SqlServerAdapter::new(connection_string)),
            SourceType::Sqlite => Box::new(SqliteAdapter::new(connection_string)),
            SourceType::LaravelLog => Box::new(LaravelLogAdapter::new(connection_string, None)),
        }
    }
}
