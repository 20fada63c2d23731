//! One-time-key trees
//!
//! A channel or endpoint is a Merkle tree over `2^depth` one-time Ed25519
//! leaf keys, all derived deterministically from an origin secret. The root
//! names the origin; signing with ordinal `n` burns leaf `n` and ships the
//! leaf's public key plus the sibling path, so verifiers only ever need the
//! root. Once every leaf is spent the origin is exhausted.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{VeilError, VeilResult};

/// Deepest tree an engine will materialize (2^16 leaves).
pub const MAX_TREE_DEPTH: u32 = 16;

const LEAF_KEY_CONTEXT: &str = "veilstream keytree leaf v1";

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// A Merkle tree of one-time signing keys.
pub struct KeyTree {
    depth: u32,
    leaves: Vec<SigningKey>,
    /// Hash levels bottom-up; `levels[0]` are leaf hashes, the last level is
    /// the root alone.
    levels: Vec<Vec<[u8; 32]>>,
}

impl KeyTree {
    /// Deterministically builds a tree from an origin secret.
    ///
    /// # Errors
    ///
    /// Returns `VeilError::Crypto` for a depth past [`MAX_TREE_DEPTH`].
    pub fn generate(secret: &[u8; 32], depth: u32) -> VeilResult<Self> {
        if depth > MAX_TREE_DEPTH {
            return Err(VeilError::Crypto(format!(
                "key tree depth {} exceeds maximum {}",
                depth, MAX_TREE_DEPTH
            )));
        }

        let leaf_count = 1usize << depth;
        let mut leaves = Vec::with_capacity(leaf_count);
        let mut leaf_hashes = Vec::with_capacity(leaf_count);
        for i in 0..leaf_count as u64 {
            let mut material = Vec::with_capacity(40);
            material.extend_from_slice(secret);
            material.extend_from_slice(&i.to_le_bytes());
            let seed = blake3::derive_key(LEAF_KEY_CONTEXT, &material);
            let key = SigningKey::from_bytes(&seed);
            leaf_hashes.push(hash_leaf(key.verifying_key().as_bytes()));
            leaves.push(key);
        }

        let mut levels = vec![leaf_hashes];
        while levels
            .last()
            .map(|level| level.len() > 1)
            .unwrap_or(false)
        {
            let current = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity(current.len() / 2);
            for pair in current.chunks_exact(2) {
                next.push(hash_node(&pair[0], &pair[1]));
            }
            levels.push(next);
        }

        Ok(Self {
            depth,
            leaves,
            levels,
        })
    }

    /// The 32-byte root naming this origin.
    pub fn root(&self) -> [u8; 32] {
        self.levels[self.levels.len() - 1][0]
    }

    /// How many one-time signatures this tree can ever produce.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// Signs `message` with leaf `ordinal`.
    ///
    /// # Errors
    ///
    /// Returns `VeilError::ChannelExhausted` once the ordinal is past the
    /// leaf budget.
    pub fn sign(&self, ordinal: u64, message: &[u8]) -> VeilResult<LeafSignature> {
        if ordinal >= self.capacity() {
            return Err(VeilError::ChannelExhausted(format!(
                "ordinal {} exceeds one-time key budget {}",
                ordinal,
                self.capacity()
            )));
        }

        let leaf = &self.leaves[ordinal as usize];
        let signature = leaf.sign(message);

        let mut proof = Vec::with_capacity(self.depth as usize);
        let mut idx = ordinal as usize;
        for level in 0..self.depth as usize {
            proof.push(self.levels[level][idx ^ 1]);
            idx >>= 1;
        }

        Ok(LeafSignature {
            ordinal,
            public_key: *leaf.verifying_key().as_bytes(),
            signature: signature.to_bytes().to_vec(),
            proof,
        })
    }
}

impl std::fmt::Debug for KeyTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyTree")
            .field("depth", &self.depth)
            .field("root", &hex::encode(self.root()))
            .finish_non_exhaustive()
    }
}

/// A one-time leaf signature with its Merkle path back to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSignature {
    /// Which leaf signed; also the message ordinal.
    pub ordinal: u64,
    /// The leaf's Ed25519 public key.
    pub public_key: [u8; 32],
    /// 64-byte Ed25519 signature.
    pub signature: Vec<u8>,
    /// Sibling hashes bottom-up.
    pub proof: Vec<[u8; 32]>,
}

impl LeafSignature {
    /// Verifies the signature and folds the proof back to `root`.
    ///
    /// Returns `false` for any defect: bad signature bytes, a leaf key that
    /// does not parse, a path that does not reach the root, or an ordinal
    /// inconsistent with the path length.
    pub fn verify(&self, root: &[u8; 32], message: &[u8]) -> bool {
        let sig_bytes: [u8; 64] = match self.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&self.public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        if verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .is_err()
        {
            return false;
        }

        let mut current = hash_leaf(&self.public_key);
        let mut idx = self.ordinal;
        for sibling in &self.proof {
            current = if idx & 1 == 0 {
                hash_node(&current, sibling)
            } else {
                hash_node(sibling, &current)
            };
            idx >>= 1;
        }
        // A surviving index means the ordinal lies outside the tree the
        // proof describes.
        idx == 0 && current == *root
    }
}

fn hash_leaf(public_key: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(public_key);
    *hasher.finalize().as_bytes()
}

fn hash_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}
