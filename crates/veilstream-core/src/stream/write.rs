//! Publishing side of a channel
//!
//! A [`WriteStream`] owns one channel and pushes [`Message`]s onto the
//! ledger as bundles. The whole publish pipeline for one message (header,
//! packet, tip selection, finalize, attach, broadcast) runs under one
//! async lock, so writes on the same stream never interleave and the
//! channel's one-time-key ordinals advance exactly once per message.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bundle::{Bundle, Transaction};
use crate::engine::ProtocolEngine;
use crate::error::{VeilError, VeilResult};
use crate::ledger::LedgerClient;
use crate::message::Message;
use crate::trinary;
use crate::types::{ChannelId, EndpointId, TxHash};

/// Tuning knobs for a write stream.
#[derive(Debug, Clone)]
pub struct WriteStreamConfig {
    /// Key tree depth for channels and endpoints; capacity is `2^depth`
    /// messages per origin.
    pub keytree_depth: u32,
    /// Tip selection depth passed to the ledger.
    pub tip_depth: u32,
    /// Proof-of-work difficulty passed to the ledger.
    pub min_weight_magnitude: u32,
}

impl Default for WriteStreamConfig {
    fn default() -> Self {
        Self {
            keytree_depth: 5,
            tip_depth: 3,
            min_weight_magnitude: 14,
        }
    }
}

/// Everything the stream lock guards: the engine plus channel/endpoint
/// assignment.
struct WriteState<E> {
    engine: E,
    channel: Option<ChannelId>,
    /// Once announced, later writes publish through this endpoint's tree.
    endpoint: Option<EndpointId>,
}

/// Single-writer publisher for one channel.
pub struct WriteStream<E, L> {
    state: Mutex<WriteState<E>>,
    ledger: Arc<L>,
    config: WriteStreamConfig,
}

impl<E: ProtocolEngine, L: LedgerClient> WriteStream<E, L> {
    pub fn new(engine: E, ledger: Arc<L>, config: WriteStreamConfig) -> Self {
        Self {
            state: Mutex::new(WriteState {
                engine,
                channel: None,
                endpoint: None,
            }),
            ledger,
            config,
        }
    }

    /// Creates the stream's channel and returns its id.
    ///
    /// The id (or its address) is what subscribers need to start reading.
    ///
    /// # Errors
    ///
    /// `StreamAlreadyOpen` on a second call; engine failures propagate
    /// unmodified.
    pub async fn open(&self) -> VeilResult<ChannelId> {
        let mut state = self.state.lock().await;
        if state.channel.is_some() {
            return Err(VeilError::StreamAlreadyOpen);
        }
        let channel = state.engine.channel_create(self.config.keytree_depth)?;
        info!(channel = %channel, "write stream opened");
        state.channel = Some(channel.clone());
        Ok(channel)
    }

    /// The channel this stream publishes under, once opened.
    pub async fn channel(&self) -> Option<ChannelId> {
        self.state.lock().await.channel.clone()
    }

    /// Publishes one message and returns its tail transaction hash.
    ///
    /// The tail hash is what a publisher hands out-of-band to subscribers
    /// who want to fetch this exact message; polling subscribers discover it
    /// at the channel address anyway. The lock is held across every engine
    /// and ledger call, so concurrent `write`s on one stream serialize.
    ///
    /// # Errors
    ///
    /// `StreamNotOpen` before [`open`](Self::open); any engine or ledger
    /// failure aborts the attempt and propagates unmodified. The caller
    /// retries; nothing partial lands on the ledger.
    pub async fn write(&self, message: &Message) -> VeilResult<TxHash> {
        let mut state = self.state.lock().await;
        let channel = state.channel.clone().ok_or(VeilError::StreamNotOpen)?;
        let endpoint = state.endpoint.clone();

        let (bundle, handle) = match &endpoint {
            Some(endpoint) => state.engine.write_header_on_endpoint(
                Bundle::new(),
                &channel,
                endpoint,
                message.groups(),
                message.recipients(),
            )?,
            None => state.engine.write_header_on_channel(
                Bundle::new(),
                &channel,
                message.groups(),
                message.recipients(),
            )?,
        };

        let payload = trinary::bytes_to_trytes(message.payload());
        let ordinal = handle.ordinal();
        let bundle = state.engine.write_packet(
            handle,
            &payload,
            message.authenticity(),
            message.is_last(),
            bundle,
        )?;

        let tail = self.submit(bundle).await?;
        debug!(channel = %channel, ordinal, tail = %tail, "published message");
        Ok(tail)
    }

    /// Creates an endpoint under the channel, publishes its channel-signed
    /// announcement and routes every later [`write`](Self::write) through
    /// the endpoint's key tree.
    ///
    /// Subscribers only accept endpoint packets after decoding the
    /// announcement, so it must land before the first endpoint message.
    pub async fn announce_endpoint(&self) -> VeilResult<(EndpointId, TxHash)> {
        let mut state = self.state.lock().await;
        let channel = state.channel.clone().ok_or(VeilError::StreamNotOpen)?;

        let endpoint = state
            .engine
            .endpoint_create(self.config.keytree_depth, &channel)?;
        let (bundle, _) = state
            .engine
            .announce_endpoint(Bundle::new(), &channel, &endpoint)?;
        let tail = self.submit(bundle).await?;

        info!(channel = %channel, endpoint = %endpoint, tail = %tail, "endpoint announced");
        state.endpoint = Some(endpoint.clone());
        Ok((endpoint, tail))
    }

    /// Destroys the engine context, wiping the stream's key material.
    ///
    /// Consuming `self` makes a second close unrepresentable.
    pub async fn close(self) -> VeilResult<()> {
        let mut state = self.state.into_inner();
        state.engine.destroy()?;
        debug!("write stream closed");
        Ok(())
    }

    /// Ships a finished bundle: tips -> finalize -> attach -> broadcast.
    async fn submit(&self, bundle: Bundle) -> VeilResult<TxHash> {
        let (trunk, branch) = self.ledger.get_tips_to_approve(self.config.tip_depth).await?;
        let bundle = self.ledger.finalize_bundle(bundle)?;
        let attached = self
            .ledger
            .attach_to_tangle(
                &trunk,
                &branch,
                self.config.min_weight_magnitude,
                bundle.to_trytes()?,
            )
            .await?;
        self.ledger.broadcast_transactions(&attached).await?;

        let tail = attached
            .first()
            .ok_or(VeilError::EmptyBundle)
            .and_then(|trytes| Transaction::from_trytes(trytes))?;
        Ok(tail.hash)
    }
}

impl<E, L> std::fmt::Debug for WriteStream<E, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream").finish_non_exhaustive()
    }
}
