/// Newline (or otherwise) delimited frames.
pub mod lines;
