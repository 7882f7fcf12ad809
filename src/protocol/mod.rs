//! Protocol module - messages, ids and length-prefixed framing.

mod frame;
mod frame_buffer;
mod message;

pub use frame::{
    build_frame, decode_header, encode_header, payload_len, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
pub use frame_buffer::FrameBuffer;
pub use message::{FloatId, IdGenerator, MessageId, Request, Response, Status, Verb};
