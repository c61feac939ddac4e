//! Wire protocol for the ARCS relay.
//!
//! Two planes share one WebSocket: binary video packets ([`frame`]) and a
//! JSON control plane ([`message`]). This crate owns the byte layouts and
//! structural validation; it performs no I/O.

pub mod frame;
pub mod message;

pub use frame::{
    encode_frame, parse_packet, starts_new_frame, AssembledFrame, FrameError, Reassembler,
    VideoPacket,
};
pub use message::{
    sanitize, validate_message, ErrorCode, ErrorMessage, MessageKind, ValidateError,
};
