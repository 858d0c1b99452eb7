pub mod compression;
pub mod glob;

pub use compression::{Codec, create_output, decode_stream, open_input};
pub use glob::{expand_glob, expand_inputs};
