//! Protocol module containing the message header, codec, compression and framing.

pub mod codec;
pub mod compression;
pub mod frame;
pub mod messages;

pub use codec::{
    decode_block_list, decode_header, decode_message, encode_block_list, encode_header,
    encode_message, read_u32, CompressionSpec, ProtocolError,
};
pub use frame::{read_frame, write_frame, FrameError};
pub use messages::*;
