pub mod client;

pub use client::{
    ApiClient, ApiError, NotifyUploadCompletionResponse, SchemaInfo, UploadTokenResponse, UserInfo,
};
