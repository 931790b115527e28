//! Wire protocol for the editor messaging endpoint

pub mod codec;

pub use codec::{Message, MessageKind, decode, encode};
