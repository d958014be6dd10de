//! Output parsing: raw byte chunks to lines, lines to events

pub mod extract;
pub mod splitter;

pub use extract::{
    extract_all, extract_file, parse_bytes_transferred, parse_progress, parse_speed,
    parse_total_size,
};
pub use splitter::LineSplitter;
