//! Binary wire protocol for the meshlink cluster client.
//!
//! A connection emits [`frame::PREAMBLE`] once, then an unbounded sequence of
//! length-prefixed [`Frame`]s. The frame header is hand-rolled fixed-width
//! binary; structured bodies (authentication, membership and partition
//! events) are `postcard`-encoded, while data-structure operation payloads
//! pass through as opaque bytes owned by the caller.

mod error;
mod frame;
pub mod messages;

pub use error::{WireError, WireResult};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, PREAMBLE};
