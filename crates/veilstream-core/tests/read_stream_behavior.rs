//! Read stream behavior tests
//!
//! Scripted ledger and engine mocks pin down the polling loop's per-tick
//! rules: deduplication, retry of absent bundles, seen-marking on decode
//! errors, best-effort error delivery and deterministic cancellation.
//! The clock is paused; ticks advance only when the tests say so.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use veilstream_core::bundle::{Bundle, Transaction};
use veilstream_core::trinary::{self, Trytes};
use veilstream_core::types::{
    Address, ChannelId, EndpointId, Psk, RecipientPublicKey, RecipientSecretKey, TxHash,
};
use veilstream_core::{
    Authenticity, LedgerClient, ProtocolEngine, ReadStream, ReadStreamConfig, SequenceHandle,
    Subscription, VeilError, VeilResult,
};

const POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Mocks
// ============================================================================

fn channel() -> ChannelId {
    ChannelId::from_root(&[5u8; 32])
}

fn hash(tag: u8) -> TxHash {
    TxHash::from_digest(&[tag; 32])
}

/// A one-transaction bundle whose transaction hash is `tail`.
fn bundle_for(tail: &TxHash) -> Bundle {
    let mut tx = Transaction::raw(channel().to_address(), trinary::bytes_to_trytes(&[1, 2]));
    tx.hash = tail.clone();
    Bundle::from_transactions(vec![tx])
}

/// Ledger scripted with a fixed hash list; counts lookups and fetches.
struct ScriptedLedger {
    hashes: Vec<TxHash>,
    /// Hashes with a fetchable bundle; the rest come back absent.
    available: Vec<TxHash>,
    fail_find: bool,
    find_count: Arc<AtomicUsize>,
    fetch_count: Arc<AtomicUsize>,
}

impl ScriptedLedger {
    fn returning(hashes: Vec<TxHash>) -> Self {
        Self {
            available: hashes.clone(),
            hashes,
            fail_find: false,
            find_count: Arc::new(AtomicUsize::new(0)),
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_absent_bundles(mut self) -> Self {
        self.available.clear();
        self
    }

    fn failing_find() -> Self {
        let mut ledger = Self::returning(Vec::new());
        ledger.fail_find = true;
        ledger
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn find_transactions(&self, _address: &Address) -> VeilResult<Vec<TxHash>> {
        self.find_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_find {
            return Err(VeilError::Ledger("node unreachable".to_string()));
        }
        Ok(self.hashes.clone())
    }

    async fn get_bundle(&self, tail: &TxHash) -> VeilResult<Option<Bundle>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.available.contains(tail) {
            Ok(Some(bundle_for(tail)))
        } else {
            Ok(None)
        }
    }

    async fn get_tips_to_approve(&self, _depth: u32) -> VeilResult<(TxHash, TxHash)> {
        Ok((TxHash::null(), TxHash::null()))
    }

    async fn attach_to_tangle(
        &self,
        _trunk: &TxHash,
        _branch: &TxHash,
        _min_weight_magnitude: u32,
        trytes: Vec<Trytes>,
    ) -> VeilResult<Vec<Trytes>> {
        Ok(trytes)
    }

    async fn broadcast_transactions(&self, _trytes: &[Trytes]) -> VeilResult<()> {
        Ok(())
    }
}

/// How the scripted engine answers `read_bundle`.
#[derive(Clone)]
enum DecodeScript {
    Payload(Vec<u8>),
    Empty,
    Error,
}

struct ScriptedEngine {
    script: DecodeScript,
    decode_count: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    fn new(script: DecodeScript) -> Self {
        Self {
            script,
            decode_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn channel_create(&mut self, _depth: u32) -> VeilResult<ChannelId> {
        unimplemented!("not exercised by these tests")
    }

    fn endpoint_create(&mut self, _depth: u32, _channel: &ChannelId) -> VeilResult<EndpointId> {
        unimplemented!("not exercised by these tests")
    }

    fn add_trusted_channel(&mut self, _channel: &ChannelId) -> VeilResult<()> {
        Ok(())
    }

    fn add_pre_shared_key(&mut self, _psk: &Psk) -> VeilResult<()> {
        Ok(())
    }

    fn add_secret_key(&mut self, _key: &RecipientSecretKey) -> VeilResult<()> {
        Ok(())
    }

    fn write_header_on_channel(
        &mut self,
        _bundle: Bundle,
        _channel: &ChannelId,
        _groups: &[Psk],
        _recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        unimplemented!("not exercised by these tests")
    }

    fn write_header_on_endpoint(
        &mut self,
        _bundle: Bundle,
        _channel: &ChannelId,
        _endpoint: &EndpointId,
        _groups: &[Psk],
        _recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        unimplemented!("not exercised by these tests")
    }

    fn announce_endpoint(
        &mut self,
        _bundle: Bundle,
        _channel: &ChannelId,
        _endpoint: &EndpointId,
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        unimplemented!("not exercised by these tests")
    }

    fn write_packet(
        &mut self,
        _handle: SequenceHandle,
        _payload: &Trytes,
        _authenticity: Authenticity,
        _last: bool,
        _bundle: Bundle,
    ) -> VeilResult<Bundle> {
        unimplemented!("not exercised by these tests")
    }

    fn read_bundle(&mut self, _bundle: &Bundle) -> VeilResult<(Trytes, bool)> {
        self.decode_count.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            DecodeScript::Payload(bytes) => Ok((trinary::bytes_to_trytes(bytes), false)),
            DecodeScript::Empty => Ok((Trytes::empty(), false)),
            DecodeScript::Error => Err(VeilError::IntegrityCheckFailed),
        }
    }

    fn destroy(&mut self) -> VeilResult<()> {
        Ok(())
    }
}

fn open_stream(
    engine: ScriptedEngine,
    ledger: ScriptedLedger,
    error_buffer: usize,
) -> Subscription {
    let mut stream = ReadStream::new(
        engine,
        Arc::new(ledger),
        ReadStreamConfig {
            poll_interval: POLL,
            error_buffer,
        },
    );
    stream.open(&channel(), &[], &[]).unwrap()
}

/// Lets `ticks` polling intervals elapse on the paused clock.
async fn run_ticks(ticks: u32) {
    tokio::time::sleep(POLL * ticks + POLL / 2).await;
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_seen_hash_is_never_refetched() {
    let ledger = ScriptedLedger::returning(vec![hash(1)]);
    let fetches = ledger.fetch_count.clone();
    let mut subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(b"once".to_vec())),
        ledger,
        16,
    );

    assert_eq!(subscription.recv().await.unwrap(), b"once");
    run_ticks(3).await;

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    subscription.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_decode_error_marks_hash_seen() {
    let ledger = ScriptedLedger::returning(vec![hash(1)]);
    let fetches = ledger.fetch_count.clone();
    let engine = ScriptedEngine::new(DecodeScript::Error);
    let decodes = engine.decode_count.clone();
    let mut subscription = open_stream(engine, ledger, 16);

    assert!(matches!(
        subscription.recv_error().await.unwrap(),
        VeilError::IntegrityCheckFailed
    ));
    run_ticks(3).await;

    // Fetched and decoded exactly once; the broken entry is not retried.
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    subscription.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_payload_is_absorbed_silently() {
    let ledger = ScriptedLedger::returning(vec![hash(1)]);
    let fetches = ledger.fetch_count.clone();
    let mut subscription = open_stream(ScriptedEngine::new(DecodeScript::Empty), ledger, 16);

    run_ticks(3).await;

    // Control bundles are decoded once, marked seen, never forwarded.
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(subscription.try_recv_error().is_none());
    let pending = tokio::time::timeout(Duration::from_millis(1), subscription.recv()).await;
    assert!(pending.is_err());
    subscription.close().await;
}

// ============================================================================
// Retry Semantics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_absent_bundle_is_retried_without_error() {
    let ledger = ScriptedLedger::returning(vec![hash(1)]).with_absent_bundles();
    let fetches = ledger.fetch_count.clone();
    let mut subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(b"never".to_vec())),
        ledger,
        16,
    );

    run_ticks(3).await;

    // Not marked seen: every tick tries the fetch again, and none of the
    // absences is an error.
    assert!(fetches.load(Ordering::SeqCst) >= 3);
    assert!(subscription.try_recv_error().is_none());
    subscription.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_find_error_is_reported_and_nonfatal() {
    let ledger = ScriptedLedger::failing_find();
    let finds = ledger.find_count.clone();
    let mut subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(Vec::new())),
        ledger,
        16,
    );

    assert!(matches!(
        subscription.recv_error().await.unwrap(),
        VeilError::Ledger(_)
    ));
    run_ticks(3).await;

    // The loop keeps polling through ledger failures.
    assert!(finds.load(Ordering::SeqCst) >= 3);
    subscription.close().await;
}

// ============================================================================
// Delivery Asymmetry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unread_errors_never_stall_the_loop() {
    let ledger = ScriptedLedger::failing_find();
    let finds = ledger.find_count.clone();
    // Buffer of one and nobody reading: every error past the first drops.
    let subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(Vec::new())),
        ledger,
        1,
    );

    run_ticks(6).await;

    assert!(finds.load(Ordering::SeqCst) >= 6);
    subscription.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_blocks_discovery_but_not_close() {
    let ledger = ScriptedLedger::returning(vec![hash(1), hash(2), hash(3)]);
    let fetches = ledger.fetch_count.clone();
    let subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(b"backlog".to_vec())),
        ledger,
        16,
    );

    run_ticks(4).await;

    // First payload fills the capacity-1 channel, the second send blocks,
    // so the third hash is never fetched while nobody consumes.
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    // Cancellation wins over the blocked send.
    tokio::time::timeout(Duration::from_secs(1), subscription.close())
        .await
        .expect("close must not hang on a blocked delivery");
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_stops_polling() {
    let ledger = ScriptedLedger::returning(Vec::new());
    let finds = ledger.find_count.clone();
    let subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(Vec::new())),
        ledger,
        16,
    );

    run_ticks(2).await;
    subscription.close().await;
    let after_close = finds.load(Ordering::SeqCst);

    run_ticks(4).await;
    assert_eq!(finds.load(Ordering::SeqCst), after_close);
}

#[tokio::test(start_paused = true)]
async fn test_drop_cancels_the_task() {
    let ledger = ScriptedLedger::returning(Vec::new());
    let finds = ledger.find_count.clone();
    let subscription = open_stream(
        ScriptedEngine::new(DecodeScript::Payload(Vec::new())),
        ledger,
        16,
    );

    run_ticks(2).await;
    drop(subscription);
    // Cancellation is prompt but the task needs a poll to observe it.
    tokio::task::yield_now().await;
    let after_drop = finds.load(Ordering::SeqCst);

    run_ticks(4).await;
    assert_eq!(finds.load(Ordering::SeqCst), after_drop);
}
