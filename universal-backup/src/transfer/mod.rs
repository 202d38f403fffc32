//! Progress reporting for long-running byte streams.

pub mod progress;
pub mod progress_stream;

pub use progress::{format_bytes, logging_callback};
pub use progress_stream::{ProgressCallback, ProgressStream};
