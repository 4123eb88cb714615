//! dgbus-core: wire format and message model, plus configuration.
//! All other dgbus crates depend on this one.

pub mod config;
pub mod escape;
pub mod message;
pub mod wire;

pub use message::{JsonPayloadDecoder, Message, PayloadDecoder, Properties};
pub use wire::{DecodeError, EncodeError, Packet, PacketBody};
