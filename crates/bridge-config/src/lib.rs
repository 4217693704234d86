pub mod mapping_config;
pub mod paths;

pub use mapping_config::MappingConfigStore;
pub use paths::BridgePaths;
