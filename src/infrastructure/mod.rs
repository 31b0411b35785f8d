pub mod blob_sink;
pub mod detector;
pub mod progress_log;
pub mod sqlite_store;

pub use blob_sink::R2BlobSink;
pub use detector::OrtDetector;
pub use progress_log::ProgressLog;
pub use sqlite_store::SqliteCatalogue;
