//! HTTP/2 transport (§4.4): frame codec, stream lifecycle, and the
//! connection's reader/writer loops.
//!
//! Shaped like the `h2` crate's module layout (frame types, a per-stream
//! state machine, flow control accounting); the HPACK subset and admission
//! bookkeeping are original to this crate (see DESIGN.md).

pub mod connection;
pub mod frame;
pub mod stream;

pub use connection::H2Connection;
pub use stream::{StreamMachine, StreamState};
