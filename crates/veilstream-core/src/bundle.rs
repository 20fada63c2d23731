//! Transactions and bundles
//!
//! A bundle is the unit of publication: an ordered run of transactions
//! carrying one wire message split into fragments. The tail transaction sits
//! at index 0 and is what readers discover and walk from. Bundles pass
//! through three states: raw (fragments only), finalized (indices, timestamps
//! and the bundle hash assigned) and attached (trunk/branch links and
//! per-transaction hashes assigned by the ledger).

use serde::{Deserialize, Serialize};

use crate::error::{VeilError, VeilResult};
use crate::trinary::{self, Trytes};
use crate::types::{Address, TxHash, ID_TRYTES};

/// Maximum trytes in one transaction's message fragment.
pub const FRAGMENT_TRYTES: usize = 2187;

/// A single ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Address the transaction is indexed under.
    pub address: Address,
    /// Message fragment, at most [`FRAGMENT_TRYTES`] trytes.
    pub fragment: Trytes,
    /// Position within the bundle; 0 is the tail.
    pub index: u64,
    /// Index of the bundle's head transaction.
    pub last_index: u64,
    /// Bundle hash shared by every transaction of the bundle.
    pub bundle: Trytes,
    /// Trunk link, assigned at attach time.
    pub trunk: TxHash,
    /// Branch link, assigned at attach time.
    pub branch: TxHash,
    /// Finalization time, seconds since the epoch.
    pub timestamp: i64,
    /// Transaction hash, assigned at attach time.
    pub hash: TxHash,
}

impl Transaction {
    /// A raw, unfinalized transaction carrying one fragment.
    pub fn raw(address: Address, fragment: Trytes) -> Self {
        Self {
            address,
            fragment,
            index: 0,
            last_index: 0,
            bundle: Trytes::null(ID_TRYTES),
            trunk: TxHash::null(),
            branch: TxHash::null(),
            timestamp: 0,
            hash: TxHash::null(),
        }
    }

    pub fn is_tail(&self) -> bool {
        self.index == 0
    }

    /// Serializes the transaction for ledger transport.
    pub fn to_trytes(&self) -> VeilResult<Trytes> {
        let bytes = postcard::to_allocvec(self)
            .map_err(|e| VeilError::Serialization(format!("transaction encoding failed: {}", e)))?;
        Ok(trinary::bytes_to_trytes(&bytes))
    }

    /// Parses a transaction from its ledger transport form.
    pub fn from_trytes(trytes: &Trytes) -> VeilResult<Self> {
        let bytes = trinary::trytes_to_bytes(trytes)?;
        postcard::from_bytes(&bytes)
            .map_err(|e| VeilError::Serialization(format!("transaction decoding failed: {}", e)))
    }

    /// Content hash over every field except the hash itself.
    ///
    /// Variable-length fields are length-prefixed so adjacent fields cannot
    /// be confused.
    pub fn compute_hash(&self) -> TxHash {
        let mut data = Vec::new();
        data.extend_from_slice(self.address.as_trytes().as_bytes());
        data.extend_from_slice(&(self.fragment.len() as u32).to_le_bytes());
        data.extend_from_slice(self.fragment.as_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.last_index.to_le_bytes());
        data.extend_from_slice(self.bundle.as_bytes());
        data.extend_from_slice(self.trunk.as_trytes().as_bytes());
        data.extend_from_slice(self.branch.as_trytes().as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        TxHash::from_digest(blake3::hash(&data).as_bytes())
    }

    /// Essence bytes folded into the bundle hash at finalization.
    fn essence(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(self.address.as_trytes().as_bytes());
        data.extend_from_slice(&(self.fragment.len() as u32).to_le_bytes());
        data.extend_from_slice(self.fragment.as_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.last_index.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data
    }
}

/// An ordered run of transactions making up one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    transactions: Vec<Transaction>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn push(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// The index-0 transaction, if the bundle is non-empty.
    pub fn tail(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.is_tail())
    }

    /// Per-transaction transport trytes, in bundle order (tail first).
    pub fn to_trytes(&self) -> VeilResult<Vec<Trytes>> {
        self.transactions.iter().map(Transaction::to_trytes).collect()
    }

    /// All fragments joined in index order, reassembling the wire message.
    pub fn message_trytes(&self) -> Trytes {
        let mut ordered: Vec<&Transaction> = self.transactions.iter().collect();
        ordered.sort_by_key(|tx| tx.index);
        let mut joined = Trytes::empty();
        for tx in ordered {
            joined.push(&tx.fragment);
        }
        joined
    }
}

/// Assigns indices, the shared timestamp and the bundle hash.
///
/// Trunk/branch links and transaction hashes stay null; those belong to the
/// ledger's attach step.
///
/// # Errors
///
/// Returns `VeilError::EmptyBundle` for a bundle with no transactions.
pub fn finalize(mut bundle: Bundle) -> VeilResult<Bundle> {
    if bundle.is_empty() {
        return Err(VeilError::EmptyBundle);
    }

    let last_index = (bundle.len() - 1) as u64;
    let timestamp = chrono::Utc::now().timestamp();
    for (i, tx) in bundle.transactions.iter_mut().enumerate() {
        tx.index = i as u64;
        tx.last_index = last_index;
        tx.timestamp = timestamp;
    }

    let mut hasher = blake3::Hasher::new();
    for tx in &bundle.transactions {
        hasher.update(&tx.essence());
    }
    let bundle_hash = trinary::bytes_to_trytes(hasher.finalize().as_bytes());
    for tx in bundle.transactions.iter_mut() {
        tx.bundle = bundle_hash.clone();
    }

    Ok(bundle)
}
