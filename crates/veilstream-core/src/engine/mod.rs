//! Protocol engine seam
//!
//! Streams drive everything cryptographic through [`ProtocolEngine`]:
//!
//! ```text
//! WriteStream                     ProtocolEngine
//!     |  channel_create            (key trees, ordinals)
//!     |  write_header_on_*   --->  bundle + SequenceHandle
//!     |  write_packet        --->  bundle (masked, checksummed)
//!
//! ReadStream
//!     |  add_trusted_channel/add_pre_shared_key/add_secret_key
//!     |  read_bundle         --->  payload trytes + last flag
//! ```
//!
//! The engine is synchronous and single-threaded by contract; streams own
//! one engine each and serialize access themselves. [`NativeEngine`] is the
//! in-process implementation; the trait leaves room for engines backed by
//! external contexts.

pub mod keytree;
pub mod native;
pub mod wire;

pub use keytree::{KeyTree, LeafSignature, MAX_TREE_DEPTH};
pub use native::NativeEngine;

use crate::bundle::Bundle;
use crate::error::VeilResult;
use crate::message::Authenticity;
use crate::trinary::Trytes;
use crate::types::{ChannelId, EndpointId, Psk, RecipientPublicKey, RecipientSecretKey};

/// Ticket for completing one message: issued by a header write, consumed by
/// exactly one packet write.
///
/// Handles are deliberately not `Clone`; the ordinal they carry is burned
/// when the header is written and can never be reused.
pub struct SequenceHandle {
    channel_root: [u8; 32],
    origin_root: [u8; 32],
    ordinal: u64,
}

impl SequenceHandle {
    pub fn new(channel_root: [u8; 32], origin_root: [u8; 32], ordinal: u64) -> Self {
        Self {
            channel_root,
            origin_root,
            ordinal,
        }
    }

    /// Root of the channel whose address the message is published under.
    pub fn channel_root(&self) -> [u8; 32] {
        self.channel_root
    }

    /// Root of the key tree that signs: the channel itself or an endpoint.
    pub fn origin_root(&self) -> [u8; 32] {
        self.origin_root
    }

    /// The one-time-key ordinal burned for this message.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

impl std::fmt::Debug for SequenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceHandle")
            .field("origin", &hex::encode(self.origin_root))
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

/// The cryptographic core a stream runs on.
///
/// All methods take `&mut self`: engines mutate ordinal counters, trust
/// registries and pending packet state. `Sync` is required because read
/// streams hold the engine across awaits inside a spawned task. Errors are
/// [`crate::VeilError`] values; engines must not panic on malformed input.
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Creates a channel key tree with `2^depth` one-time keys and returns
    /// its id.
    fn channel_create(&mut self, depth: u32) -> VeilResult<ChannelId>;

    /// Creates an endpoint key tree under an owned channel.
    fn endpoint_create(&mut self, depth: u32, channel: &ChannelId) -> VeilResult<EndpointId>;

    /// Registers a channel this engine will accept bundles from.
    fn add_trusted_channel(&mut self, channel: &ChannelId) -> VeilResult<()>;

    /// Registers a pre-shared group key for unwrapping session keys.
    fn add_pre_shared_key(&mut self, psk: &Psk) -> VeilResult<()>;

    /// Registers a recipient secret key for unwrapping session keys.
    fn add_secret_key(&mut self, key: &RecipientSecretKey) -> VeilResult<()>;

    /// Writes a message header on a channel, burning the channel's next
    /// ordinal. The session key is wrapped for `groups` and `recipients`;
    /// with neither, the message is public.
    fn write_header_on_channel(
        &mut self,
        bundle: Bundle,
        channel: &ChannelId,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)>;

    /// Writes a message header on an endpoint of an owned channel, burning
    /// the endpoint's next ordinal.
    fn write_header_on_endpoint(
        &mut self,
        bundle: Bundle,
        channel: &ChannelId,
        endpoint: &EndpointId,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)>;

    /// Writes a channel-signed announcement introducing `endpoint` to
    /// subscribers. Announcement bundles decode to an empty payload.
    fn announce_endpoint(
        &mut self,
        bundle: Bundle,
        channel: &ChannelId,
        endpoint: &EndpointId,
    ) -> VeilResult<(Bundle, SequenceHandle)>;

    /// Encrypts and checksums `payload`, completing the message the handle
    /// was issued for.
    fn write_packet(
        &mut self,
        handle: SequenceHandle,
        payload: &Trytes,
        authenticity: Authenticity,
        last: bool,
        bundle: Bundle,
    ) -> VeilResult<Bundle>;

    /// Decodes a bundle fetched from the ledger.
    ///
    /// Returns the payload trytes (empty for control bundles such as
    /// endpoint announcements) and the last-packet flag.
    fn read_bundle(&mut self, bundle: &Bundle) -> VeilResult<(Trytes, bool)>;

    /// Wipes all key material. Every later call fails with
    /// `ContextDestroyed`.
    fn destroy(&mut self) -> VeilResult<()>;
}
