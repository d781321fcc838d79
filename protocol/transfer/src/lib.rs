//! Wire protocol for the file-transfer server.
//!
//! Every packet is a little-endian `i64` body length followed by the body.
//! Bodies are little-endian sequences of fixed-width integers and
//! length-prefixed byte strings, where the length uses a 7-bit varint
//! (low seven bits per byte, high bit flags continuation).
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_transfer::{Cmd, Request, split_frame};
//!
//! let req = Request::upload(7, "d41d8cd98f00b204e9800998ecf8427e", 0, 5, b"hello".as_ref());
//! let mut wire = BytesMut::new();
//! req.encode_frame(&mut wire);
//!
//! let (body, consumed) = split_frame(&wire).unwrap().unwrap();
//! assert_eq!(consumed, wire.len());
//! let decoded = Request::decode(body).unwrap();
//! assert_eq!(decoded.cmd, Cmd::UploadReq);
//! assert_eq!(decoded.seq, 7);
//! ```

mod chunk;
mod codec;
mod frame;
mod message;

pub use chunk::{BROADBAND_CHUNK, CELLULAR_CHUNK, chunk_size};
pub use codec::{
    CodecError, Reader, Writer, decode_varint32, decode_varint64, encode_varint32,
    encode_varint64,
};
pub use frame::{FrameError, HEADER_LEN, MAX_BODY_LEN, split_frame, write_frame};
pub use message::{Cmd, DecodeError, NetType, Request, Response, TransferCode};
