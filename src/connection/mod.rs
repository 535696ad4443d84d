//! Transport-agnostic connection identity and state, plus the protocol-aware
//! H1/H2 implementations.

mod common;
pub mod h1;
pub mod h2;

pub use common::{Connection, ConnectionState, Protocol};
