//! Write stream behavior tests
//!
//! Mock engine and ledger instrumentation for the single-writer discipline:
//! ordinals advance once per message and concurrent writers never
//! interleave engine or ledger calls.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use veilstream_core::bundle::{Bundle, Transaction};
use veilstream_core::trinary::{self, Trytes};
use veilstream_core::types::{
    Address, ChannelId, EndpointId, Psk, RecipientPublicKey, RecipientSecretKey, TxHash,
};
use veilstream_core::{
    Authenticity, LedgerClient, Message, ProtocolEngine, SequenceHandle, VeilResult, WriteStream,
    WriteStreamConfig,
};

// ============================================================================
// Instrumentation
// ============================================================================

/// Shared call trace across the mock engine and mock ledger.
#[derive(Clone, Default)]
struct CallTrace(Arc<Mutex<Vec<&'static str>>>);

impl CallTrace {
    fn record(&self, call: &'static str) {
        self.0.lock().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

/// Engine that hands out incrementing ordinals and records its calls.
struct TracingEngine {
    trace: CallTrace,
    root: [u8; 32],
    next_ordinal: u64,
    issued: Arc<Mutex<Vec<u64>>>,
}

impl TracingEngine {
    fn new(trace: CallTrace, issued: Arc<Mutex<Vec<u64>>>) -> Self {
        Self {
            trace,
            root: [7u8; 32],
            next_ordinal: 0,
            issued,
        }
    }

    fn address(&self) -> Address {
        ChannelId::from_root(&self.root).to_address()
    }
}

impl ProtocolEngine for TracingEngine {
    fn channel_create(&mut self, _depth: u32) -> VeilResult<ChannelId> {
        self.trace.record("channel_create");
        Ok(ChannelId::from_root(&self.root))
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
        mut bundle: Bundle,
        _channel: &ChannelId,
        _groups: &[Psk],
        _recipients: &[RecipientPublicKey],
    ) -> VeilResult<(Bundle, SequenceHandle)> {
        self.trace.record("header");
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.issued.lock().push(ordinal);
        bundle.push(Transaction::raw(
            self.address(),
            trinary::bytes_to_trytes(&[0]),
        ));
        Ok((bundle, SequenceHandle::new(self.root, self.root, ordinal)))
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
        payload: &Trytes,
        _authenticity: Authenticity,
        _last: bool,
        mut bundle: Bundle,
    ) -> VeilResult<Bundle> {
        self.trace.record("packet");
        bundle.push(Transaction::raw(self.address(), payload.clone()));
        Ok(bundle)
    }

    fn read_bundle(&mut self, _bundle: &Bundle) -> VeilResult<(Trytes, bool)> {
        unimplemented!("not exercised by these tests")
    }

    fn destroy(&mut self) -> VeilResult<()> {
        self.trace.record("destroy");
        Ok(())
    }
}

/// Ledger that records its calls and yields between them, giving concurrent
/// writers every chance to interleave if the stream lock allowed it.
struct TracingLedger {
    trace: CallTrace,
}

#[async_trait]
impl LedgerClient for TracingLedger {
    async fn find_transactions(&self, _address: &Address) -> VeilResult<Vec<TxHash>> {
        Ok(Vec::new())
    }

    async fn get_bundle(&self, _tail: &TxHash) -> VeilResult<Option<Bundle>> {
        Ok(None)
    }

    async fn get_tips_to_approve(&self, _depth: u32) -> VeilResult<(TxHash, TxHash)> {
        self.trace.record("tips");
        tokio::task::yield_now().await;
        Ok((TxHash::null(), TxHash::null()))
    }

    async fn attach_to_tangle(
        &self,
        trunk: &TxHash,
        branch: &TxHash,
        _min_weight_magnitude: u32,
        trytes: Vec<Trytes>,
    ) -> VeilResult<Vec<Trytes>> {
        self.trace.record("attach");
        tokio::task::yield_now().await;
        let mut transactions = trytes
            .iter()
            .map(Transaction::from_trytes)
            .collect::<VeilResult<Vec<_>>>()?;
        let mut next_hash = trunk.clone();
        for tx in transactions.iter_mut().rev() {
            tx.trunk = next_hash;
            tx.branch = branch.clone();
            tx.hash = tx.compute_hash();
            next_hash = tx.hash.clone();
        }
        transactions.iter().map(Transaction::to_trytes).collect()
    }

    async fn broadcast_transactions(&self, _trytes: &[Trytes]) -> VeilResult<()> {
        self.trace.record("broadcast");
        tokio::task::yield_now().await;
        Ok(())
    }
}

fn traced_stream(
    trace: &CallTrace,
    issued: &Arc<Mutex<Vec<u64>>>,
) -> WriteStream<TracingEngine, TracingLedger> {
    WriteStream::new(
        TracingEngine::new(trace.clone(), issued.clone()),
        Arc::new(TracingLedger {
            trace: trace.clone(),
        }),
        WriteStreamConfig::default(),
    )
}

/// Engine and ledger calls one `write` makes, in order.
const WRITE_SEQUENCE: [&str; 5] = ["header", "packet", "tips", "attach", "broadcast"];

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_sequential_writes_issue_increasing_ordinals() {
    let trace = CallTrace::default();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let stream = traced_stream(&trace, &issued);
    stream.open().await.unwrap();

    for text in ["a", "b", "c"] {
        let message = Message::builder().create(text.as_bytes().to_vec()).unwrap();
        stream.write(&message).await.unwrap();
    }

    assert_eq!(*issued.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_concurrent_writes_never_interleave() {
    let trace = CallTrace::default();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let stream = Arc::new(traced_stream(&trace, &issued));
    stream.open().await.unwrap();

    let writers = (0..4).map(|i| {
        let stream = stream.clone();
        async move {
            let message = Message::builder().create(vec![i as u8]).unwrap();
            stream.write(&message).await.unwrap();
        }
    });
    futures::future::join_all(writers).await;

    // Strip the open() call, then every write's five calls must form one
    // contiguous block; a lock failure would shuffle them.
    let calls = trace.calls();
    assert_eq!(calls[0], "channel_create");
    let writes = &calls[1..];
    assert_eq!(writes.len(), 4 * WRITE_SEQUENCE.len());
    for block in writes.chunks(WRITE_SEQUENCE.len()) {
        assert_eq!(block, WRITE_SEQUENCE);
    }
    assert_eq!(*issued.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_write_failure_aborts_attempt() {
    /// Ledger whose broadcast always fails.
    struct FailingLedger;

    #[async_trait]
    impl LedgerClient for FailingLedger {
        async fn find_transactions(&self, _address: &Address) -> VeilResult<Vec<TxHash>> {
            Ok(Vec::new())
        }

        async fn get_bundle(&self, _tail: &TxHash) -> VeilResult<Option<Bundle>> {
            Ok(None)
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
            Err(veilstream_core::VeilError::Ledger(
                "node unreachable".to_string(),
            ))
        }
    }

    let trace = CallTrace::default();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let stream = WriteStream::new(
        TracingEngine::new(trace.clone(), issued.clone()),
        Arc::new(FailingLedger),
        WriteStreamConfig::default(),
    );
    stream.open().await.unwrap();

    let message = Message::builder().create(b"doomed".to_vec()).unwrap();
    let result = stream.write(&message).await;
    assert!(matches!(
        result,
        Err(veilstream_core::VeilError::Ledger(_))
    ));

    // The caller retries with a fresh message; the stream stays usable and
    // the engine keeps sequencing.
    let retry = stream.write(&message).await;
    assert!(retry.is_err());
    assert_eq!(*issued.lock(), vec![0, 1]);
}
