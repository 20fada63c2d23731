//! Native protocol engine
//!
//! The in-process [`ProtocolEngine`]: all key trees grow deterministically
//! out of one seed, trust and key registries live in plain maps, and wire
//! bytes are fragmented straight into bundle transactions. Reading enforces
//! trust first, then checksums, then opens the mask.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::bundle::{Bundle, Transaction, FRAGMENT_TRYTES};
use crate::engine::keytree::KeyTree;
use crate::engine::wire::{self, Announcement, Body, Header, Packet, PacketChecksum, SessionKeyAccess};
use crate::engine::{ProtocolEngine, SequenceHandle};
use crate::error::{VeilError, VeilResult};
use crate::message::Authenticity;
use crate::trinary::{self, Trytes};
use crate::types::{Address, ChannelId, EndpointId, Psk, RecipientPublicKey, RecipientSecretKey, Seed};

const MASTER_KEY_CONTEXT: &str = "veilstream master secret v1";
const CHANNEL_SECRET_CONTEXT: &str = "veilstream channel secret v1";
const ENDPOINT_SECRET_CONTEXT: &str = "veilstream endpoint secret v1";

struct ChannelState {
    tree: KeyTree,
    next_ordinal: u64,
    next_endpoint: u64,
}

struct EndpointState {
    tree: KeyTree,
    next_ordinal: u64,
    channel_root: [u8; 32],
}

/// Seed-rooted reference engine.
pub struct NativeEngine {
    master: [u8; 32],
    next_channel: u64,
    /// Own channels by key tree root.
    channels: HashMap<[u8; 32], ChannelState>,
    /// Own endpoints by key tree root.
    endpoints: HashMap<[u8; 32], EndpointState>,
    /// Foreign channels this engine accepts bundles from.
    trusted_channels: HashSet<[u8; 32]>,
    /// Endpoints learned from announcements: endpoint root -> channel root.
    trusted_endpoints: HashMap<[u8; 32], [u8; 32]>,
    /// Registered group keys by psk id.
    psks: HashMap<String, [u8; 32]>,
    /// Registered recipient keys by fingerprint.
    secret_keys: HashMap<[u8; 32], RecipientSecretKey>,
    /// Session keys awaiting their packet: (origin root, ordinal) -> key.
    pending: HashMap<([u8; 32], u64), [u8; 32]>,
    destroyed: bool,
}

impl NativeEngine {
    /// Builds an engine whose entire key material derives from `seed`.
    pub fn new(seed: &Seed) -> Self {
        let master = blake3::derive_key(MASTER_KEY_CONTEXT, seed.as_trytes().as_bytes());
        Self {
            master,
            next_channel: 0,
            channels: HashMap::new(),
            endpoints: HashMap::new(),
            trusted_channels: HashSet::new(),
            trusted_endpoints: HashMap::new(),
            psks: HashMap::new(),
            secret_keys: HashMap::new(),
            pending: HashMap::new(),
            destroyed: false,
        }
    }

    fn ensure_alive(&self) -> VeilResult<()> {
        if self.destroyed {
            return Err(VeilError::ContextDestroyed);
        }
        Ok(())
    }

    /// Burns and returns the next ordinal of an owned channel.
    fn burn_channel_ordinal(&mut self, channel_root: &[u8; 32]) -> VeilResult<u64> {
        let state = self
            .channels
            .get_mut(channel_root)
            .ok_or_else(|| VeilError::UnknownChannel(ChannelId::from_root(channel_root).to_string()))?;
        if state.next_ordinal >= state.tree.capacity() {
            return Err(VeilError::ChannelExhausted(format!(
                "channel {} spent all {} one-time keys",
                ChannelId::from_root(channel_root),
                state.tree.capacity()
            )));
        }
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        Ok(ordinal)
    }

    /// Burns and returns the next ordinal of an owned endpoint, checking it
    /// belongs to `channel_root`.
    fn burn_endpoint_ordinal(
        &mut self,
        channel_root: &[u8; 32],
        endpoint_root: &[u8; 32],
    ) -> VeilResult<u64> {
        let state = self
            .endpoints
            .get_mut(endpoint_root)
            .ok_or_else(|| VeilError::UnknownEndpoint(EndpointId::from_root(endpoint_root).to_string()))?;
        if state.channel_root != *channel_root {
            return Err(VeilError::UnknownEndpoint(format!(
                "endpoint {} does not belong to channel {}",
                EndpointId::from_root(endpoint_root),
                ChannelId::from_root(channel_root)
            )));
        }
        if state.next_ordinal >= state.tree.capacity() {
            return Err(VeilError::ChannelExhausted(format!(
                "endpoint {} spent all {} one-time keys",
                EndpointId::from_root(endpoint_root),
                state.tree.capacity()
            )));
        }
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        Ok(ordinal)
    }

    /// Chooses the session key and its access structure for a new message.
    fn session_access(
        &self,
        origin_root: &[u8; 32],
        ordinal: u64,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<([u8; 32], SessionKeyAccess)> {
        if groups.is_empty() && recipients.is_empty() {
            return Ok((
                wire::public_session_key(origin_root, ordinal),
                SessionKeyAccess::Public,
            ));
        }

        let session_key = wire::random_session_key();
        let mut group_wraps = Vec::with_capacity(groups.len());
        for psk in groups {
            group_wraps.push(wire::wrap_for_group(psk, &session_key)?);
        }
        let mut recipient_wraps = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            recipient_wraps.push(wire::wrap_for_recipient(recipient, &session_key)?);
        }
        Ok((
            session_key,
            SessionKeyAccess::Wrapped {
                groups: group_wraps,
                recipients: recipient_wraps,
            },
        ))
    }

    /// Writes a header and parks its session key until the packet arrives.
    fn write_header(
        &mut self,
        mut bundle: Bundle,
        channel_root: [u8; 32],
        origin_root: [u8; 32],
        ordinal: u64,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        let (session_key, session) = self.session_access(&origin_root, ordinal, groups, recipients)?;
        let header = Header {
            version: wire::WIRE_VERSION,
            channel_root,
            origin_root,
            ordinal,
            session,
        };
        append_wire(&mut bundle, &channel_address(&channel_root), &header)?;
        self.pending.insert((origin_root, ordinal), session_key);
        Ok((bundle, SequenceHandle::new(channel_root, origin_root, ordinal)))
    }

    /// Recovers the session key a packet was masked with.
    fn recover_session_key(&self, header: &Header, access: &SessionKeyAccess) -> VeilResult<[u8; 32]> {
        match access {
            SessionKeyAccess::Public => Ok(wire::public_session_key(
                &header.origin_root,
                header.ordinal,
            )),
            SessionKeyAccess::Wrapped { groups, recipients } => {
                for wrap in groups {
                    if let Some(psk_key) = self.psks.get(&wrap.psk_id) {
                        return wire::unwrap_group(wrap, psk_key);
                    }
                }
                for wrap in recipients {
                    if let Some(secret) = self.secret_keys.get(&wrap.fingerprint) {
                        return wire::unwrap_recipient(wrap, secret);
                    }
                }
                Err(VeilError::NoDecryptionKey)
            }
        }
    }

    /// Trust checks on a decoded header, applied before anything is opened.
    fn check_trust(&self, header: &Header) -> VeilResult<()> {
        let channel_known = self.trusted_channels.contains(&header.channel_root)
            || self.channels.contains_key(&header.channel_root);
        if !channel_known {
            return Err(VeilError::UntrustedChannel(
                ChannelId::from_root(&header.channel_root).to_string(),
            ));
        }

        if header.origin_root != header.channel_root {
            let endpoint_known = self
                .trusted_endpoints
                .get(&header.origin_root)
                .map(|channel| *channel == header.channel_root)
                .unwrap_or(false)
                || self
                    .endpoints
                    .get(&header.origin_root)
                    .map(|state| state.channel_root == header.channel_root)
                    .unwrap_or(false);
            if !endpoint_known {
                return Err(VeilError::UntrustedEndpoint(
                    EndpointId::from_root(&header.origin_root).to_string(),
                ));
            }
        }
        Ok(())
    }

    fn read_announcement(&mut self, header: &Header, announcement: &Announcement) -> VeilResult<(Trytes, bool)> {
        if header.origin_root != header.channel_root {
            return Err(VeilError::SignatureInvalid(
                "announcement must originate from its channel".to_string(),
            ));
        }
        if announcement.signature.ordinal != header.ordinal {
            return Err(VeilError::SignatureInvalid(
                "announcement signature ordinal mismatch".to_string(),
            ));
        }
        let binding = wire::announcement_binding(
            &header.channel_root,
            header.ordinal,
            &announcement.endpoint_root,
        );
        if !announcement.signature.verify(&header.channel_root, &binding) {
            return Err(VeilError::SignatureInvalid(
                "endpoint announcement signature rejected".to_string(),
            ));
        }

        self.trusted_endpoints
            .insert(announcement.endpoint_root, header.channel_root);
        debug!(
            endpoint = %EndpointId::from_root(&announcement.endpoint_root),
            channel = %ChannelId::from_root(&header.channel_root),
            "absorbed endpoint announcement"
        );
        Ok((Trytes::empty(), false))
    }

    fn read_packet(&self, header: &Header, packet: &Packet) -> VeilResult<(Trytes, bool)> {
        let session_key = self.recover_session_key(header, &header.session)?;

        // Checksum before mask: a forged packet is rejected without
        // touching its contents.
        let binding = wire::packet_binding(
            &header.origin_root,
            header.ordinal,
            &packet.nonce,
            &packet.ciphertext,
            packet.last,
        );
        match &packet.checksum {
            PacketChecksum::None => {}
            PacketChecksum::Mac(tag) => {
                if !wire::mac_verify(&session_key, &binding, tag) {
                    return Err(VeilError::IntegrityCheckFailed);
                }
            }
            PacketChecksum::Signature(signature) => {
                if signature.ordinal != header.ordinal {
                    return Err(VeilError::SignatureInvalid(
                        "packet signature ordinal mismatch".to_string(),
                    ));
                }
                if !signature.verify(&header.origin_root, &binding) {
                    return Err(VeilError::SignatureInvalid(
                        "packet signature rejected".to_string(),
                    ));
                }
            }
        }

        let plaintext = wire::open(&session_key, &packet.nonce, &packet.ciphertext)?;
        let payload = String::from_utf8(plaintext)
            .map_err(|e| VeilError::Transcoding(format!("payload is not tryte text: {}", e)))?;
        Ok((Trytes::new(payload)?, packet.last))
    }
}

impl ProtocolEngine for NativeEngine {
    fn channel_create(&mut self, depth: u32) -> VeilResult<ChannelId> {
        self.ensure_alive()?;

        let mut material = Vec::with_capacity(40);
        material.extend_from_slice(&self.master);
        material.extend_from_slice(&self.next_channel.to_le_bytes());
        let secret = blake3::derive_key(CHANNEL_SECRET_CONTEXT, &material);
        self.next_channel += 1;

        let tree = KeyTree::generate(&secret, depth)?;
        let root = tree.root();
        self.channels.insert(
            root,
            ChannelState {
                tree,
                next_ordinal: 0,
                next_endpoint: 0,
            },
        );
        let id = ChannelId::from_root(&root);
        debug!(channel = %id, depth, "created channel");
        Ok(id)
    }

    fn endpoint_create(&mut self, depth: u32, channel: &ChannelId) -> VeilResult<EndpointId> {
        self.ensure_alive()?;
        let channel_root = channel.root()?;

        let endpoint_index = {
            let state = self
                .channels
                .get_mut(&channel_root)
                .ok_or_else(|| VeilError::UnknownChannel(channel.to_string()))?;
            let index = state.next_endpoint;
            state.next_endpoint += 1;
            index
        };

        let mut material = Vec::with_capacity(72);
        material.extend_from_slice(&self.master);
        material.extend_from_slice(&channel_root);
        material.extend_from_slice(&endpoint_index.to_le_bytes());
        let secret = blake3::derive_key(ENDPOINT_SECRET_CONTEXT, &material);

        let tree = KeyTree::generate(&secret, depth)?;
        let root = tree.root();
        self.endpoints.insert(
            root,
            EndpointState {
                tree,
                next_ordinal: 0,
                channel_root,
            },
        );
        let id = EndpointId::from_root(&root);
        debug!(endpoint = %id, channel = %channel, depth, "created endpoint");
        Ok(id)
    }

    fn add_trusted_channel(&mut self, channel: &ChannelId) -> VeilResult<()> {
        self.ensure_alive()?;
        self.trusted_channels.insert(channel.root()?);
        debug!(channel = %channel, "registered trusted channel");
        Ok(())
    }

    fn add_pre_shared_key(&mut self, psk: &Psk) -> VeilResult<()> {
        self.ensure_alive()?;
        self.psks.insert(psk.id().as_str().to_string(), *psk.key());
        debug!(psk = %psk.id(), "registered pre-shared key");
        Ok(())
    }

    fn add_secret_key(&mut self, key: &RecipientSecretKey) -> VeilResult<()> {
        self.ensure_alive()?;
        self.secret_keys.insert(key.fingerprint(), key.clone());
        debug!(fingerprint = %hex::encode(key.fingerprint()), "registered recipient key");
        Ok(())
    }

    fn write_header_on_channel(
        &mut self,
        bundle: Bundle,
        channel: &ChannelId,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        self.ensure_alive()?;
        let channel_root = channel.root()?;
        let ordinal = self.burn_channel_ordinal(&channel_root)?;
        let result = self.write_header(bundle, channel_root, channel_root, ordinal, groups, recipients)?;
        debug!(channel = %channel, ordinal, "wrote channel header");
        Ok(result)
    }

    fn write_header_on_endpoint(
        &mut self,
        bundle: Bundle,
        channel: &ChannelId,
        endpoint: &EndpointId,
        groups: &[Psk],
        recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        self.ensure_alive()?;
        let channel_root = channel.root()?;
        let endpoint_root = endpoint.root()?;
        let ordinal = self.burn_endpoint_ordinal(&channel_root, &endpoint_root)?;
        let result = self.write_header(bundle, channel_root, endpoint_root, ordinal, groups, recipients)?;
        debug!(endpoint = %endpoint, ordinal, "wrote endpoint header");
        Ok(result)
    }

    fn announce_endpoint(
        &mut self,
        mut bundle: Bundle,
        channel: &ChannelId,
        endpoint: &EndpointId,
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        self.ensure_alive()?;
        let channel_root = channel.root()?;
        let endpoint_root = endpoint.root()?;

        let endpoint_owned = self
            .endpoints
            .get(&endpoint_root)
            .map(|state| state.channel_root == channel_root)
            .unwrap_or(false);
        if !endpoint_owned {
            return Err(VeilError::UnknownEndpoint(endpoint.to_string()));
        }

        let ordinal = self.burn_channel_ordinal(&channel_root)?;
        let binding = wire::announcement_binding(&channel_root, ordinal, &endpoint_root);
        let signature = self
            .channels
            .get(&channel_root)
            .ok_or_else(|| VeilError::UnknownChannel(channel.to_string()))?
            .tree
            .sign(ordinal, &binding)?;

        let header = Header {
            version: wire::WIRE_VERSION,
            channel_root,
            origin_root: channel_root,
            ordinal,
            session: SessionKeyAccess::Public,
        };
        let address = channel_address(&channel_root);
        append_wire(&mut bundle, &address, &header)?;
        append_wire(
            &mut bundle,
            &address,
            &Body::Announcement(Announcement {
                endpoint_root,
                signature,
            }),
        )?;

        debug!(endpoint = %endpoint, channel = %channel, ordinal, "announced endpoint");
        Ok((bundle, SequenceHandle::new(channel_root, channel_root, ordinal)))
    }

    fn write_packet(
        &mut self,
        handle: SequenceHandle,
        payload: &Trytes,
        authenticity: Authenticity,
        last: bool,
        mut bundle: Bundle,
    ) -> VeilResult<Bundle> {
        self.ensure_alive()?;

        let session_key = self
            .pending
            .remove(&(handle.origin_root(), handle.ordinal()))
            .ok_or_else(|| {
                VeilError::InvalidSequenceHandle(format!(
                    "no pending packet for ordinal {}",
                    handle.ordinal()
                ))
            })?;

        let nonce = wire::random_nonce();
        let ciphertext = wire::seal(&session_key, &nonce, payload.as_bytes())?;
        let binding = wire::packet_binding(
            &handle.origin_root(),
            handle.ordinal(),
            &nonce,
            &ciphertext,
            last,
        );

        let checksum = match authenticity {
            Authenticity::None => PacketChecksum::None,
            Authenticity::Mac => PacketChecksum::Mac(wire::mac_tag(&session_key, &binding)),
            Authenticity::Signed => {
                let origin_root = handle.origin_root();
                let tree = self
                    .channels
                    .get(&origin_root)
                    .map(|state| &state.tree)
                    .or_else(|| self.endpoints.get(&origin_root).map(|state| &state.tree))
                    .ok_or_else(|| {
                        VeilError::InvalidSequenceHandle(
                            "signing origin is not owned by this engine".to_string(),
                        )
                    })?;
                PacketChecksum::Signature(tree.sign(handle.ordinal(), &binding)?)
            }
        };

        append_wire(
            &mut bundle,
            &channel_address(&handle.channel_root()),
            &Body::Packet(Packet {
                nonce,
                ciphertext,
                last,
                checksum,
            }),
        )?;
        debug!(ordinal = handle.ordinal(), last, "wrote packet");
        Ok(bundle)
    }

    fn read_bundle(&mut self, bundle: &Bundle) -> VeilResult<(Trytes, bool)> {
        self.ensure_alive()?;
        if bundle.is_empty() {
            return Err(VeilError::EmptyBundle);
        }

        let stream = bundle.message_trytes();
        let bytes = trinary::trytes_to_bytes(&stream)?;
        let (header, body_bytes) = wire::decode_header(&bytes)?;

        if header.version != wire::WIRE_VERSION {
            return Err(VeilError::VersionUnsupported(header.version));
        }
        self.check_trust(&header)?;

        match wire::decode_body(body_bytes)? {
            Body::Announcement(announcement) => self.read_announcement(&header, &announcement),
            Body::Packet(packet) => self.read_packet(&header, &packet),
        }
    }

    fn destroy(&mut self) -> VeilResult<()> {
        self.ensure_alive()?;
        self.master = [0u8; 32];
        self.channels.clear();
        self.endpoints.clear();
        self.trusted_channels.clear();
        self.trusted_endpoints.clear();
        self.psks.clear();
        self.secret_keys.clear();
        self.pending.clear();
        self.destroyed = true;
        debug!("engine context destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("channels", &self.channels.len())
            .field("endpoints", &self.endpoints.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

fn channel_address(channel_root: &[u8; 32]) -> Address {
    ChannelId::from_root(channel_root).to_address()
}

/// Fragments one wire value into raw transactions at `address`.
fn append_wire<T: Serialize>(bundle: &mut Bundle, address: &Address, value: &T) -> VeilResult<()> {
    let bytes = wire::encode(value)?;
    let trytes = trinary::bytes_to_trytes(&bytes);
    for fragment in trytes.chunks(FRAGMENT_TRYTES) {
        bundle.push(Transaction::raw(address.clone(), fragment));
    }
    Ok(())
}
