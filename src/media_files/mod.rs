//! Placing downloaded audio on disk.

mod writer;

pub use writer::{sanitize_filename, track_file_stem, FsMediaWriter};
