pub mod batch;
pub mod uploader;

pub use batch::BatchUploader;
pub use uploader::{FileUploader, ProgressCallback};
