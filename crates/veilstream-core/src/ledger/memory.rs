//! In-memory reference ledger
//!
//! A process-local [`LedgerClient`] backing tests and the demo driver. The
//! handle clones cheaply and every clone observes the same store, so a
//! writer and any number of readers can share one ledger. Proof-of-work is
//! elided: attach assigns links and hashes directly and accepts the weight
//! argument without honoring it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::bundle::{Bundle, Transaction};
use crate::error::{VeilError, VeilResult};
use crate::ledger::LedgerClient;
use crate::trinary::Trytes;
use crate::types::{Address, TxHash};

#[derive(Default)]
struct LedgerState {
    /// Every broadcast transaction by hash.
    transactions: HashMap<TxHash, Transaction>,
    /// Hashes recorded per address, in broadcast order.
    by_address: HashMap<Address, Vec<TxHash>>,
    /// Hashes no broadcast transaction has approved yet.
    tips: Vec<TxHash>,
}

/// Shared in-process ledger.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total transactions stored, across all addresses.
    pub fn transaction_count(&self) -> usize {
        self.inner.lock().transactions.len()
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryLedger")
            .field("transactions", &state.transactions.len())
            .field("tips", &state.tips.len())
            .finish()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn find_transactions(&self, address: &Address) -> VeilResult<Vec<TxHash>> {
        let state = self.inner.lock();
        Ok(state
            .by_address
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_bundle(&self, tail: &TxHash) -> VeilResult<Option<Bundle>> {
        let state = self.inner.lock();
        let Some(tail_tx) = state.transactions.get(tail) else {
            return Ok(None);
        };
        if !tail_tx.is_tail() {
            return Ok(None);
        }

        // Walk trunk links tail -> head; any gap means the bundle has not
        // fully propagated. `last_index` is untrusted input, so the walk
        // sizes the buffer itself instead of pre-reserving from it.
        let mut transactions = Vec::new();
        let mut current = tail_tx.clone();
        loop {
            let at_head = current.index == current.last_index;
            let trunk = current.trunk.clone();
            let index = current.index;
            let bundle_hash = current.bundle.clone();
            transactions.push(current);
            if at_head {
                break;
            }
            let Some(next) = state.transactions.get(&trunk) else {
                return Ok(None);
            };
            if next.index != index + 1 || next.bundle != bundle_hash {
                return Ok(None);
            }
            current = next.clone();
        }
        Ok(Some(Bundle::from_transactions(transactions)))
    }

    async fn get_tips_to_approve(&self, _depth: u32) -> VeilResult<(TxHash, TxHash)> {
        let state = self.inner.lock();
        // Genesis bundles anchor to the null hash pair.
        let trunk = state.tips.last().cloned().unwrap_or_else(TxHash::null);
        let branch = state
            .tips
            .len()
            .checked_sub(2)
            .and_then(|i| state.tips.get(i).cloned())
            .unwrap_or_else(|| trunk.clone());
        Ok((trunk, branch))
    }

    async fn attach_to_tangle(
        &self,
        trunk: &TxHash,
        branch: &TxHash,
        _min_weight_magnitude: u32,
        trytes: Vec<Trytes>,
    ) -> VeilResult<Vec<Trytes>> {
        if trytes.is_empty() {
            return Err(VeilError::Ledger("nothing to attach".to_string()));
        }
        let mut transactions = trytes
            .iter()
            .map(Transaction::from_trytes)
            .collect::<VeilResult<Vec<_>>>()?;

        // Head first: the head approves the tips, every earlier transaction
        // trunk-links to its successor and branch-links to the branch tip.
        let mut next_hash = trunk.clone();
        for tx in transactions.iter_mut().rev() {
            tx.trunk = next_hash;
            tx.branch = branch.clone();
            tx.hash = tx.compute_hash();
            next_hash = tx.hash.clone();
        }

        transactions.iter().map(Transaction::to_trytes).collect()
    }

    async fn broadcast_transactions(&self, trytes: &[Trytes]) -> VeilResult<()> {
        let transactions = trytes
            .iter()
            .map(Transaction::from_trytes)
            .collect::<VeilResult<Vec<_>>>()?;

        if transactions.iter().any(|tx| tx.hash.is_null()) {
            return Err(VeilError::Ledger(
                "cannot broadcast an unattached transaction".to_string(),
            ));
        }

        // Intra-bundle trunk links point tail -> head, so tip retirement
        // runs after every hash is in place; retiring per transaction would
        // leave approved non-tails stranded as tips.
        let approved: std::collections::HashSet<TxHash> = transactions
            .iter()
            .flat_map(|tx| [tx.trunk.clone(), tx.branch.clone()])
            .collect();

        let mut state = self.inner.lock();
        for tx in transactions {
            state.tips.push(tx.hash.clone());
            state
                .by_address
                .entry(tx.address.clone())
                .or_default()
                .push(tx.hash.clone());
            debug!(hash = %tx.hash, address = %tx.address, index = tx.index, "stored transaction");
            state.transactions.insert(tx.hash.clone(), tx);
        }
        state.tips.retain(|tip| !approved.contains(tip));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::finalize;
    use crate::trinary;
    use crate::types::ChannelId;

    fn address(tag: u8) -> Address {
        ChannelId::from_root(&[tag; 32]).to_address()
    }

    fn raw_bundle(tag: u8, fragments: usize) -> Bundle {
        let mut bundle = Bundle::new();
        for i in 0..fragments {
            let fragment = trinary::bytes_to_trytes(&[tag, i as u8, 3]);
            bundle.push(Transaction::raw(address(tag), fragment));
        }
        bundle
    }

    async fn publish(ledger: &MemoryLedger, tag: u8, fragments: usize) -> TxHash {
        let bundle = ledger.finalize_bundle(raw_bundle(tag, fragments)).unwrap();
        let (trunk, branch) = ledger.get_tips_to_approve(3).await.unwrap();
        let attached = ledger
            .attach_to_tangle(&trunk, &branch, 14, bundle.to_trytes().unwrap())
            .await
            .unwrap();
        ledger.broadcast_transactions(&attached).await.unwrap();
        Transaction::from_trytes(&attached[0]).unwrap().hash
    }

    #[tokio::test]
    async fn test_empty_ledger_has_null_tips() {
        let ledger = MemoryLedger::new();
        let (trunk, branch) = ledger.get_tips_to_approve(3).await.unwrap();
        assert!(trunk.is_null());
        assert!(branch.is_null());
    }

    #[tokio::test]
    async fn test_publish_and_find() {
        let ledger = MemoryLedger::new();
        let tail = publish(&ledger, 1, 3).await;

        let found = ledger.find_transactions(&address(1)).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.contains(&tail));
        assert!(ledger
            .find_transactions(&address(2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_bundle_walks_trunk_links() {
        let ledger = MemoryLedger::new();
        let tail = publish(&ledger, 1, 3).await;

        let bundle = ledger.get_bundle(&tail).await.unwrap().unwrap();
        assert_eq!(bundle.len(), 3);
        let txs = bundle.transactions();
        for (i, tx) in txs.iter().enumerate() {
            assert_eq!(tx.index, i as u64);
        }
        assert_eq!(txs[0].trunk, txs[1].hash);
        assert_eq!(txs[1].trunk, txs[2].hash);
    }

    #[tokio::test]
    async fn test_get_bundle_rejects_non_tail() {
        let ledger = MemoryLedger::new();
        let tail = publish(&ledger, 1, 2).await;
        let bundle = ledger.get_bundle(&tail).await.unwrap().unwrap();
        let head_hash = bundle.transactions()[1].hash.clone();

        assert!(ledger.get_bundle(&head_hash).await.unwrap().is_none());
        assert!(ledger.get_bundle(&TxHash::null()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incomplete_bundle_is_absent() {
        let ledger = MemoryLedger::new();
        let bundle = finalize(raw_bundle(1, 2)).unwrap();
        let (trunk, branch) = ledger.get_tips_to_approve(3).await.unwrap();
        let attached = ledger
            .attach_to_tangle(&trunk, &branch, 14, bundle.to_trytes().unwrap())
            .await
            .unwrap();

        // Only the tail propagates.
        ledger
            .broadcast_transactions(&attached[..1])
            .await
            .unwrap();
        let tail = Transaction::from_trytes(&attached[0]).unwrap().hash;
        assert!(ledger.get_bundle(&tail).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tips_advance_with_bundles() {
        let ledger = MemoryLedger::new();
        let first_tail = publish(&ledger, 1, 1).await;

        let (trunk, _) = ledger.get_tips_to_approve(3).await.unwrap();
        assert_eq!(trunk, first_tail);

        publish(&ledger, 2, 1).await;
        let (trunk, _) = ledger.get_tips_to_approve(3).await.unwrap();
        // The first tail was approved and retired.
        assert_ne!(trunk, first_tail);
    }

    #[tokio::test]
    async fn test_multi_transaction_bundle_retires_inner_tips() {
        let ledger = MemoryLedger::new();
        let tail = publish(&ledger, 1, 3).await;
        let bundle = ledger.get_bundle(&tail).await.unwrap().unwrap();

        // Only the tail is unapproved; the mid and head transactions are
        // approved by intra-bundle trunk links and must never be offered.
        let (trunk, branch) = ledger.get_tips_to_approve(3).await.unwrap();
        assert_eq!(trunk, tail);
        for tx in &bundle.transactions()[1..] {
            assert_ne!(trunk, tx.hash);
            assert_ne!(branch, tx.hash);
        }
    }

    #[tokio::test]
    async fn test_forged_last_index_yields_no_bundle() {
        let ledger = MemoryLedger::new();
        let mut bundle = Bundle::new();
        let mut tx = Transaction::raw(address(1), trinary::bytes_to_trytes(&[9, 9]));
        tx.last_index = u64::MAX;
        bundle.push(tx);

        let (trunk, branch) = ledger.get_tips_to_approve(3).await.unwrap();
        let attached = ledger
            .attach_to_tangle(&trunk, &branch, 14, bundle.to_trytes().unwrap())
            .await
            .unwrap();
        ledger.broadcast_transactions(&attached).await.unwrap();

        let tail = Transaction::from_trytes(&attached[0]).unwrap().hash;
        assert!(ledger.get_bundle(&tail).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_rejects_unattached() {
        let ledger = MemoryLedger::new();
        let bundle = finalize(raw_bundle(1, 1)).unwrap();
        let result = ledger
            .broadcast_transactions(&bundle.to_trytes().unwrap())
            .await;
        assert!(matches!(result, Err(VeilError::Ledger(_))));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let ledger = MemoryLedger::new();
        let clone = ledger.clone();
        publish(&ledger, 1, 2).await;
        assert_eq!(clone.transaction_count(), 2);
    }
}
