pub mod adapter;
pub mod convert;
pub mod factory;
pub mod laravel_log;
pub mod mysql;
pub mod postgres;
pub mod query;
pub mod sqlite_adapter;
pub mod sqlserver;

pub use adapter::{PkValue, SourceAdapter, SourceError};
pub use factory::SourceAdapterFactory;
pub use query::build_query;
