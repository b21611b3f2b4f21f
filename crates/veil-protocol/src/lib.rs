//! veil-protocol: Wire protocol for the Veil terminal bridge
//!
//! This crate defines the JSON message protocol spoken between browser-side
//! terminal clients and the bridge, carried as newline-delimited JSON over a
//! persistent byte-stream transport.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{BridgeCodec, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use message::{BridgeMessage, TerminalSize};
