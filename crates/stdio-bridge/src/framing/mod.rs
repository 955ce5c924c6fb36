//! Wire framing for relayed messages.
//!
//! # Architecture
//!
//! - **codec**: newline-delimited JSON over the subprocess pipes (both directions)
//! - **frame**: one-shot `Content-Length` classifier for inbound HTTP bodies

pub mod codec;
pub mod frame;

pub use codec::LineJsonCodec;
pub use frame::{decode_framed, decode_payload};
