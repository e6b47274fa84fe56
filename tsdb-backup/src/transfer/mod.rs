//! Moving snapshot bytes between the server and the archive directory.

pub mod compression;
pub mod progress;
pub mod progress_stream;
