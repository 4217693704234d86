pub mod state_store;
pub mod token_cache;

pub use state_store::MappingStateStore;
pub use token_cache::TokenCache;
