pub mod batch_writer;
pub mod writer;

pub use batch_writer::JsonlBatchWriter;
pub use writer::JsonlWriter;
