//! RESP encoder and incremental decoder.

mod decoder;
mod encoder;

pub(crate) use decoder::would_block;
pub use decoder::Decoder;
pub use encoder::{command_len, encode_command, Encoder};
