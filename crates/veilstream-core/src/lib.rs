//! Veilstream Core Library
//!
//! Masked, authenticated message streams over an append-only,
//! address-indexed ledger.
//!
//! ## Overview
//!
//! A publisher owns a *channel*: a one-time-key tree whose 32-byte root
//! doubles as the channel's identity and (checksummed) ledger address.
//! Messages become transaction bundles at that address; subscribers poll
//! the address, deduplicate what they have already processed and decode
//! whatever their key material entitles them to: public messages,
//! group-encrypted ones under a pre-shared key, or per-recipient encrypted
//! ones under a hybrid asymmetric key.
//!
//! The crate splits along two seams: [`engine::ProtocolEngine`] (the
//! cryptographic state machine, with [`engine::NativeEngine`] as the
//! in-process implementation) and [`ledger::LedgerClient`] (the
//! transaction store, with [`ledger::MemoryLedger`] for tests and demos).
//! [`stream::WriteStream`] and [`stream::ReadStream`] drive the two seams.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use veilstream_core::{
//!     Message, NativeEngine, MemoryLedger, ReadStream, ReadStreamConfig,
//!     Seed, WriteStream, WriteStreamConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = Arc::new(MemoryLedger::new());
//!
//!     // Publisher side
//!     let writer = WriteStream::new(
//!         NativeEngine::new(&Seed::random()),
//!         ledger.clone(),
//!         WriteStreamConfig::default(),
//!     );
//!     let channel = writer.open().await?;
//!     let message = Message::builder().signed().create(b"hello".to_vec())?;
//!     writer.write(&message).await?;
//!
//!     // Subscriber side
//!     let mut reader = ReadStream::new(
//!         NativeEngine::new(&Seed::random()),
//!         ledger,
//!         ReadStreamConfig::default(),
//!     );
//!     let mut subscription = reader.open(&channel, &[], &[])?;
//!     let payload = subscription.recv().await;
//!     assert_eq!(payload.as_deref(), Some(b"hello".as_slice()));
//!
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod message;
pub mod stream;
pub mod trinary;
pub mod types;

// Re-exports
pub use bundle::{Bundle, Transaction, FRAGMENT_TRYTES};
pub use engine::{NativeEngine, ProtocolEngine, SequenceHandle};
pub use error::{VeilError, VeilResult};
pub use ledger::{LedgerClient, MemoryLedger};
pub use message::{Authenticity, Confidentiality, Message, MessageBuilder};
pub use stream::{
    ReadStream, ReadStreamConfig, Subscription, WriteStream, WriteStreamConfig,
};
pub use trinary::Trytes;
pub use types::{
    Address, ChannelId, EndpointId, Psk, PskId, RecipientPublicKey, RecipientSecretKey, Seed,
    TxHash,
};
