//! Ledger client seam
//!
//! Streams talk to the ledger through [`LedgerClient`]: an address-indexed,
//! append-only transaction store that is a remote service in production and
//! [`MemoryLedger`] in tests and demos. The publish pipeline runs
//! tips -> finalize -> attach -> broadcast; discovery runs
//! find -> fetch-bundle. The client owns nothing about message
//! content, it moves opaque transaction trytes.

pub mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;

use crate::bundle::{self, Bundle};
use crate::error::VeilResult;
use crate::trinary::Trytes;
use crate::types::{Address, TxHash};

/// The ledger a stream publishes to and polls.
///
/// Implementations are shared across tasks behind an `Arc`, so all methods
/// take `&self`. Errors are opaque to the core: streams propagate them
/// without interpretation and never retry on their own.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// All transaction hashes recorded at `address`, tails and non-tails
    /// alike, in ledger order.
    async fn find_transactions(&self, address: &Address) -> VeilResult<Vec<TxHash>>;

    /// The full bundle whose tail is `tail`.
    ///
    /// `None` when the hash is unknown, names a non-tail transaction, or the
    /// bundle has not fully propagated yet. Callers treat `None` as
    /// retryable.
    async fn get_bundle(&self, tail: &TxHash) -> VeilResult<Option<Bundle>>;

    /// Two tip transactions for a new bundle to approve.
    async fn get_tips_to_approve(&self, depth: u32) -> VeilResult<(TxHash, TxHash)>;

    /// Performs proof-of-work over finalized transaction trytes, assigning
    /// trunk/branch links and transaction hashes.
    ///
    /// `trytes` is tail-first; the returned trytes keep that order.
    async fn attach_to_tangle(
        &self,
        trunk: &TxHash,
        branch: &TxHash,
        min_weight_magnitude: u32,
        trytes: Vec<Trytes>,
    ) -> VeilResult<Vec<Trytes>>;

    /// Stores attached transactions and gossips them to the network.
    async fn broadcast_transactions(&self, trytes: &[Trytes]) -> VeilResult<()>;

    /// Assigns indices, timestamps and the bundle hash.
    ///
    /// Finalization is pure and runs locally by default; remote clients may
    /// override it to delegate to a node.
    fn finalize_bundle(&self, bundle: Bundle) -> VeilResult<Bundle> {
        bundle::finalize(bundle)
    }
}
