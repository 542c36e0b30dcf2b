//! Protocol module containing the message set and the JSON frame codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_message, encode_message, encode_message_now, ProtocolError};
pub use messages::*;
