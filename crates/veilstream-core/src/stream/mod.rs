//! Write and read streams
//!
//! The streaming layer proper: [`WriteStream`] serializes publication onto
//! one channel, [`ReadStream`] polls a channel address in the background
//! and delivers decoded payloads through a [`Subscription`]. Both sit on
//! the [`ProtocolEngine`](crate::engine::ProtocolEngine) and
//! [`LedgerClient`](crate::ledger::LedgerClient) seams and carry no
//! cryptographic state of their own.

pub mod read;
pub mod write;

pub use read::{ReadStream, ReadStreamConfig, Subscription};
pub use write::{WriteStream, WriteStreamConfig};
