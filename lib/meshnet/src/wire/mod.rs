//! Frames and deframes the record stream carried by any byte-stream transport. Datagram
//! transports use the same record encoding but exchange exactly one record per datagram
//! (see `transport::datagram`), so they go through `frame::encode_*` directly without an
//! accumulator.

pub mod accumulator;
pub mod frame;

pub use accumulator::ByteAccumulator;
pub use frame::{ControlRecord, Frame};
