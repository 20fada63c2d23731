//! Core identifiers and key material for Veilstream
//!
//! Channels and endpoints are named by the 32-byte root of their one-time-key
//! tree, carried as 64 trytes. Payload recipients hold a hybrid X25519 +
//! ML-KEM-768 keypair; groups share a 32-byte pre-shared key under a tryte id.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{PublicKey as KemPublicKey, SecretKey as KemSecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{VeilError, VeilResult};
use crate::trinary::{self, checksum_trytes, Trytes, CHECKSUM_TRYTES};

/// Trytes in a seed.
pub const SEED_TRYTES: usize = 81;

/// Trytes in a channel/endpoint id or transaction hash (a 32-byte digest).
pub const ID_TRYTES: usize = 64;

/// Trytes in a checksummed address.
pub const ADDRESS_TRYTES: usize = ID_TRYTES + CHECKSUM_TRYTES;

/// Trytes in a pre-shared key id.
pub const PSK_ID_TRYTES: usize = 27;

fn validate_digest_trytes(trytes: &Trytes, what: &str) -> VeilResult<()> {
    if trytes.len() != ID_TRYTES {
        return Err(VeilError::InvalidTrytes(format!(
            "{} must be {} trytes, got {}",
            what,
            ID_TRYTES,
            trytes.len()
        )));
    }
    Ok(())
}

fn digest_from_trytes(trytes: &Trytes, what: &str) -> VeilResult<[u8; 32]> {
    let bytes = trinary::trytes_to_bytes(trytes)?;
    bytes
        .try_into()
        .map_err(|_| VeilError::InvalidTrytes(format!("{} does not encode 32 bytes", what)))
}

/// An 81-tryte seed rooting all key material of an engine.
///
/// Seeds never appear in logs; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Seed(Trytes);

impl Seed {
    /// Generates a random seed.
    pub fn random() -> Self {
        Self(trinary::random_trytes(SEED_TRYTES))
    }

    /// Wraps existing trytes.
    ///
    /// # Errors
    ///
    /// Returns `VeilError::InvalidTrytes` if the length is not 81.
    pub fn from_trytes(trytes: Trytes) -> VeilResult<Self> {
        if trytes.len() != SEED_TRYTES {
            return Err(VeilError::InvalidTrytes(format!(
                "seed must be {} trytes, got {}",
                SEED_TRYTES,
                trytes.len()
            )));
        }
        Ok(Self(trytes))
    }

    pub fn as_trytes(&self) -> &Trytes {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seed(<redacted>)")
    }
}

/// A channel id: the tryte form of the channel key tree's 32-byte root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(Trytes);

impl ChannelId {
    pub fn from_root(root: &[u8; 32]) -> Self {
        Self(trinary::bytes_to_trytes(root))
    }

    /// Validates and wraps id trytes.
    pub fn from_trytes(trytes: Trytes) -> VeilResult<Self> {
        validate_digest_trytes(&trytes, "channel id")?;
        digest_from_trytes(&trytes, "channel id")?;
        Ok(Self(trytes))
    }

    /// The 32-byte key tree root this id encodes.
    pub fn root(&self) -> VeilResult<[u8; 32]> {
        digest_from_trytes(&self.0, "channel id")
    }

    /// The checksummed ledger address messages of this channel are indexed by.
    pub fn to_address(&self) -> Address {
        Address::from_body(&self.0)
    }

    pub fn as_trytes(&self) -> &Trytes {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_trytes(Trytes::new(s)?)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let trytes = Trytes::deserialize(deserializer)?;
        Self::from_trytes(trytes).map_err(serde::de::Error::custom)
    }
}

/// An endpoint id: the tryte form of an endpoint key tree's 32-byte root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(Trytes);

impl EndpointId {
    pub fn from_root(root: &[u8; 32]) -> Self {
        Self(trinary::bytes_to_trytes(root))
    }

    pub fn from_trytes(trytes: Trytes) -> VeilResult<Self> {
        validate_digest_trytes(&trytes, "endpoint id")?;
        digest_from_trytes(&trytes, "endpoint id")?;
        Ok(Self(trytes))
    }

    pub fn root(&self) -> VeilResult<[u8; 32]> {
        digest_from_trytes(&self.0, "endpoint id")
    }

    pub fn as_trytes(&self) -> &Trytes {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EndpointId {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_trytes(Trytes::new(s)?)
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EndpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let trytes = Trytes::deserialize(deserializer)?;
        Self::from_trytes(trytes).map_err(serde::de::Error::custom)
    }
}

/// A checksummed ledger address: 64 body trytes plus 9 checksum trytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(Trytes);

impl Address {
    /// Appends a checksum to 64 body trytes.
    pub(crate) fn from_body(body: &Trytes) -> Self {
        let mut full = body.clone();
        full.push(&checksum_trytes(body));
        Self(full)
    }

    /// Validates and wraps address trytes, including the checksum.
    pub fn from_trytes(trytes: Trytes) -> VeilResult<Self> {
        if trytes.len() != ADDRESS_TRYTES {
            return Err(VeilError::InvalidTrytes(format!(
                "address must be {} trytes, got {}",
                ADDRESS_TRYTES,
                trytes.len()
            )));
        }
        let addr = Self(trytes);
        if !addr.verify_checksum() {
            return Err(VeilError::InvalidTrytes(
                "address checksum mismatch".to_string(),
            ));
        }
        Ok(addr)
    }

    /// Recomputes the checksum over the body and compares.
    pub fn verify_checksum(&self) -> bool {
        checksum_trytes(&self.body()) == self.checksum()
    }

    /// The 64 body trytes (the channel id portion).
    pub fn body(&self) -> Trytes {
        Trytes::from_validated(self.0.as_str()[..ID_TRYTES].to_string())
    }

    /// The 9 checksum trytes.
    pub fn checksum(&self) -> Trytes {
        Trytes::from_validated(self.0.as_str()[ID_TRYTES..].to_string())
    }

    pub fn as_trytes(&self) -> &Trytes {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let trytes = Trytes::deserialize(deserializer)?;
        Self::from_trytes(trytes).map_err(serde::de::Error::custom)
    }
}

/// A transaction hash: 64 trytes encoding a 32-byte digest.
///
/// The null hash (all `9`s) marks unattached links and genesis tips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(Trytes);

impl TxHash {
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(trinary::bytes_to_trytes(digest))
    }

    pub fn from_trytes(trytes: Trytes) -> VeilResult<Self> {
        validate_digest_trytes(&trytes, "transaction hash")?;
        Ok(Self(trytes))
    }

    /// The all-`9` null hash.
    pub fn null() -> Self {
        Self(Trytes::null(ID_TRYTES))
    }

    pub fn is_null(&self) -> bool {
        self.0.as_bytes().iter().all(|&b| b == b'9')
    }

    pub fn as_trytes(&self) -> &Trytes {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let trytes = Trytes::deserialize(deserializer)?;
        Self::from_trytes(trytes).map_err(serde::de::Error::custom)
    }
}

/// A 27-tryte pre-shared key id, carried in clear so readers can locate
/// the wrap meant for their group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PskId(Trytes);

impl PskId {
    pub fn new(s: impl Into<String>) -> VeilResult<Self> {
        let trytes = Trytes::new(s)?;
        if trytes.len() != PSK_ID_TRYTES {
            return Err(VeilError::InvalidTrytes(format!(
                "psk id must be {} trytes, got {}",
                PSK_ID_TRYTES,
                trytes.len()
            )));
        }
        Ok(Self(trytes))
    }

    pub fn random() -> Self {
        Self(trinary::random_trytes(PSK_ID_TRYTES))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for PskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pre-shared group key: public id plus 32 secret bytes.
#[derive(Clone)]
pub struct Psk {
    id: PskId,
    key: [u8; 32],
}

impl Psk {
    pub fn new(id: PskId, key: [u8; 32]) -> Self {
        Self { id, key }
    }

    /// Generates a random key under the given id.
    pub fn generate(id: PskId) -> Self {
        use rand::RngCore;

        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { id, key }
    }

    pub fn id(&self) -> &PskId {
        &self.id
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Psk")
            .field("id", &self.id.as_str())
            .finish_non_exhaustive()
    }
}

/// Hybrid recipient secret key combining X25519 and ML-KEM-768 (Kyber768).
///
/// Holders can unwrap per-recipient session keys addressed to their
/// public key's fingerprint.
pub struct RecipientSecretKey {
    /// X25519 secret (classical)
    x25519: StaticSecret,
    /// ML-KEM-768 secret key (post-quantum)
    mlkem: kyber768::SecretKey,
    /// ML-KEM-768 public key (cached, not derivable from the secret)
    mlkem_public: kyber768::PublicKey,
}

impl RecipientSecretKey {
    /// Generate a new random recipient keypair
    pub fn generate() -> Self {
        // Use getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        let x25519 = StaticSecret::from(seed);

        let (mlkem_public, mlkem) = kyber768::keypair();

        Self {
            x25519,
            mlkem,
            mlkem_public,
        }
    }

    /// The public half recipients share with publishers.
    pub fn public_key(&self) -> RecipientPublicKey {
        RecipientPublicKey {
            x25519: X25519PublicKey::from(&self.x25519),
            mlkem: self.mlkem_public.clone(),
        }
    }

    /// Fingerprint of the public half.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.public_key().fingerprint()
    }

    pub(crate) fn x25519(&self) -> &StaticSecret {
        &self.x25519
    }

    pub(crate) fn mlkem(&self) -> &kyber768::SecretKey {
        &self.mlkem
    }
}

impl Clone for RecipientSecretKey {
    fn clone(&self) -> Self {
        // Clone ML-KEM keys by getting bytes and reconstructing
        let mlkem = kyber768::SecretKey::from_bytes(self.mlkem.as_bytes())
            .expect("Valid key should always clone");
        let mlkem_public = kyber768::PublicKey::from_bytes(self.mlkem_public.as_bytes())
            .expect("Valid key should always clone");

        Self {
            x25519: StaticSecret::from(self.x25519.to_bytes()),
            mlkem,
            mlkem_public,
        }
    }
}

impl std::fmt::Debug for RecipientSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientSecretKey")
            .field("fingerprint", &hex::encode(self.fingerprint()))
            .finish_non_exhaustive()
    }
}

/// Hybrid recipient public key combining X25519 and ML-KEM-768 (Kyber768).
#[derive(Clone)]
pub struct RecipientPublicKey {
    /// X25519 public key (classical)
    x25519: X25519PublicKey,
    /// ML-KEM-768 public key (post-quantum)
    mlkem: kyber768::PublicKey,
}

impl RecipientPublicKey {
    /// blake3 digest over both public key components.
    ///
    /// Wire headers carry this so readers can locate wraps addressed to them.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.x25519.as_bytes());
        hasher.update(self.mlkem.as_bytes());
        *hasher.finalize().as_bytes()
    }

    pub(crate) fn x25519(&self) -> &X25519PublicKey {
        &self.x25519
    }

    pub(crate) fn mlkem(&self) -> &kyber768::PublicKey {
        &self.mlkem
    }

    /// Serialize the public key to bytes
    ///
    /// Format: [x25519: 32 bytes][mlkem_len: 4 bytes LE][mlkem: variable]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mlkem_bytes = self.mlkem.as_bytes();

        let mut bytes = Vec::with_capacity(32 + 4 + mlkem_bytes.len());
        bytes.extend_from_slice(self.x25519.as_bytes());
        bytes.extend_from_slice(&(mlkem_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(mlkem_bytes);
        bytes
    }

    /// Deserialize a public key from bytes
    pub fn from_bytes(bytes: &[u8]) -> VeilResult<Self> {
        if bytes.len() < 36 {
            return Err(VeilError::Crypto("Public key too short".to_string()));
        }

        let x25519_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| VeilError::Crypto("Invalid X25519 public key length".to_string()))?;
        let x25519 = X25519PublicKey::from(x25519_bytes);

        let mlkem_len = u32::from_le_bytes(
            bytes[32..36]
                .try_into()
                .map_err(|_| VeilError::Crypto("Invalid ML-KEM length".to_string()))?,
        ) as usize;

        if bytes.len() < 36 + mlkem_len {
            return Err(VeilError::Crypto("Public key data truncated".to_string()));
        }

        let mlkem = kyber768::PublicKey::from_bytes(&bytes[36..36 + mlkem_len])
            .map_err(|_| VeilError::Crypto("Invalid ML-KEM public key".to_string()))?;

        Ok(Self { x25519, mlkem })
    }
}

impl std::fmt::Debug for RecipientPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientPublicKey")
            .field("fingerprint", &hex::encode(self.fingerprint()))
            .finish()
    }
}

impl PartialEq for RecipientPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.x25519.as_bytes() == other.x25519.as_bytes()
            && self.mlkem.as_bytes() == other.mlkem.as_bytes()
    }
}

impl Eq for RecipientPublicKey {}
