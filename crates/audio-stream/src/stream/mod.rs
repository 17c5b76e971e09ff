//! Byte-stream front ends over the codec backends.

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;
