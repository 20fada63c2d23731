//! Wire structures and session-key wrapping
//!
//! Every bundle carries one wire message: a cleartext [`Header`] followed by
//! a [`Body`]. The payload is always masked under a 32-byte session key; the
//! header says how readers obtain it:
//!
//! ```text
//! SESSION KEY ACCESS:
//!   Public   -> derived from the origin root and ordinal; anyone who knows
//!               the channel can derive it
//!   Wrapped  -> random key, wrapped once per PSK group (located by psk id)
//!               and once per recipient (located by key fingerprint):
//!               1. X25519:  ss1 = x25519(ephemeral_sk, recipient_pk)
//!               2. ML-KEM:  (ss2, ciphertext) = encapsulate(recipient_mlkem_pk)
//!               3. Combine: wrap_key = HKDF(ss1 || ss2, "combined")
//!               4. Wrap:    wrapped = ChaCha20Poly1305(wrap_key, session_key)
//! ```
//!
//! Headers and bodies are independent postcard values; the header is decoded
//! with `take_from_bytes` so the body can follow it in the same fragment
//! stream.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext, SharedSecret};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::engine::keytree::LeafSignature;
use crate::error::{VeilError, VeilResult};
use crate::types::{Psk, RecipientPublicKey, RecipientSecretKey};

/// Current wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"veilstream-key-exchange-v1";

const PUBLIC_SESSION_CONTEXT: &str = "veilstream public session v1";
const PSK_WRAP_CONTEXT: &str = "veilstream psk wrap v1";
const MAC_KEY_CONTEXT: &str = "veilstream packet mac v1";

/// Cleartext header opening every wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    /// Root of the channel whose address the bundle lives at.
    pub channel_root: [u8; 32],
    /// Root of the signing key tree: the channel itself or an endpoint.
    pub origin_root: [u8; 32],
    /// One-time-key ordinal burned for this message.
    pub ordinal: u64,
    pub session: SessionKeyAccess,
}

/// How readers obtain the session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionKeyAccess {
    /// Derivable from the origin root and ordinal.
    Public,
    /// Wrapped per group and per recipient.
    Wrapped {
        groups: Vec<GroupWrap>,
        recipients: Vec<RecipientWrap>,
    },
}

/// Session key wrapped under a key derived from a pre-shared group key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupWrap {
    /// PSK id (cleartext, for lookup)
    pub psk_id: String,
    pub nonce: [u8; NONCE_SIZE],
    pub wrapped_key: Vec<u8>,
}

/// Session key wrapped for one recipient via hybrid key exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientWrap {
    /// Recipient public key fingerprint (cleartext, for lookup)
    pub fingerprint: [u8; 32],
    /// X25519 ephemeral public key used for this recipient
    pub x25519_ephemeral_pk: [u8; 32],
    /// ML-KEM ciphertext (encapsulated key)
    pub mlkem_ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub wrapped_key: Vec<u8>,
}

/// What follows the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Body {
    /// A user payload.
    Packet(Packet),
    /// A channel-signed control message introducing an endpoint.
    Announcement(Announcement),
}

/// Masked user payload plus its checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    /// Whether this message closes its stream.
    pub last: bool,
    pub checksum: PacketChecksum,
}

/// Authenticity material attached to a packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PacketChecksum {
    None,
    /// Keyed blake3 over the packet binding.
    Mac([u8; 32]),
    /// One-time leaf signature over the packet binding.
    Signature(LeafSignature),
}

/// Endpoint introduction, signed by the channel's key tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub endpoint_root: [u8; 32],
    pub signature: LeafSignature,
}

/// Serializes a wire value.
pub fn encode<T: Serialize>(value: &T) -> VeilResult<Vec<u8>> {
    postcard::to_allocvec(value)
        .map_err(|e| VeilError::Serialization(format!("wire encoding failed: {}", e)))
}

/// Decodes a header from the front of a fragment stream, returning the
/// remaining body bytes.
pub fn decode_header(bytes: &[u8]) -> VeilResult<(Header, &[u8])> {
    postcard::take_from_bytes(bytes)
        .map_err(|e| VeilError::Serialization(format!("header decoding failed: {}", e)))
}

/// Decodes the body following a header.
pub fn decode_body(bytes: &[u8]) -> VeilResult<Body> {
    postcard::from_bytes(bytes)
        .map_err(|e| VeilError::Serialization(format!("body decoding failed: {}", e)))
}

/// Generate a new random 32-byte session key.
pub fn random_session_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Generate a random AEAD nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Session key for a public message, derivable by anyone holding the
/// origin root.
pub fn public_session_key(origin_root: &[u8; 32], ordinal: u64) -> [u8; 32] {
    let mut material = Vec::with_capacity(40);
    material.extend_from_slice(origin_root);
    material.extend_from_slice(&ordinal.to_le_bytes());
    blake3::derive_key(PUBLIC_SESSION_CONTEXT, &material)
}

/// Encrypt with ChaCha20-Poly1305 under an explicit nonce.
pub fn seal(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> VeilResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| VeilError::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt with ChaCha20-Poly1305 under an explicit nonce.
pub fn open(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> VeilResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| VeilError::DecryptionFailed(format!("AEAD open failed: {}", e)))
}

/// Bytes a packet checksum commits to: the header identity plus the masked
/// payload. Variable fields are length-prefixed.
pub fn packet_binding(
    origin_root: &[u8; 32],
    ordinal: u64,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    last: bool,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 8 + NONCE_SIZE + 4 + ciphertext.len() + 1);
    data.extend_from_slice(origin_root);
    data.extend_from_slice(&ordinal.to_le_bytes());
    data.extend_from_slice(nonce);
    data.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    data.extend_from_slice(ciphertext);
    data.push(last as u8);
    data
}

/// Bytes an announcement signature commits to.
pub fn announcement_binding(
    channel_root: &[u8; 32],
    ordinal: u64,
    endpoint_root: &[u8; 32],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 8 + 32);
    data.extend_from_slice(channel_root);
    data.extend_from_slice(&ordinal.to_le_bytes());
    data.extend_from_slice(endpoint_root);
    data
}

/// Keyed MAC over a packet binding.
pub fn mac_tag(session_key: &[u8; 32], binding: &[u8]) -> [u8; 32] {
    let mac_key = blake3::derive_key(MAC_KEY_CONTEXT, session_key);
    *blake3::keyed_hash(&mac_key, binding).as_bytes()
}

/// Constant-time MAC comparison.
pub fn mac_verify(session_key: &[u8; 32], binding: &[u8], tag: &[u8; 32]) -> bool {
    let expected = blake3::derive_key(MAC_KEY_CONTEXT, session_key);
    blake3::keyed_hash(&expected, binding) == blake3::Hash::from(*tag)
}

/// Wraps a session key under a pre-shared group key.
pub fn wrap_for_group(psk: &Psk, session_key: &[u8; 32]) -> VeilResult<GroupWrap> {
    let wrap_key = blake3::derive_key(PSK_WRAP_CONTEXT, psk.key());
    let nonce = random_nonce();
    let wrapped_key = seal(&wrap_key, &nonce, session_key)?;
    Ok(GroupWrap {
        psk_id: psk.id().as_str().to_string(),
        nonce,
        wrapped_key,
    })
}

/// Recovers a session key from a group wrap.
pub fn unwrap_group(wrap: &GroupWrap, psk_key: &[u8; 32]) -> VeilResult<[u8; 32]> {
    let wrap_key = blake3::derive_key(PSK_WRAP_CONTEXT, psk_key);
    let key = open(&wrap_key, &wrap.nonce, &wrap.wrapped_key)?;
    key.try_into()
        .map_err(|_| VeilError::DecryptionFailed("unwrapped session key has wrong length".to_string()))
}

/// Wraps a session key for one recipient via hybrid key exchange.
pub fn wrap_for_recipient(
    recipient: &RecipientPublicKey,
    session_key: &[u8; 32],
) -> VeilResult<RecipientWrap> {
    // Generate ephemeral X25519 keypair
    let mut ephemeral_seed = [0u8; 32];
    getrandom::getrandom(&mut ephemeral_seed)
        .map_err(|e| VeilError::Crypto(format!("Failed to generate ephemeral key: {}", e)))?;
    let ephemeral_secret = X25519StaticSecret::from(ephemeral_seed);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    // X25519 key exchange
    let x25519_shared = ephemeral_secret.diffie_hellman(recipient.x25519());

    // ML-KEM encapsulation (note: returns (SharedSecret, Ciphertext))
    let (mlkem_shared, mlkem_ciphertext) = kyber768::encapsulate(recipient.mlkem());

    let wrap_key = combine_secrets(x25519_shared.as_bytes(), mlkem_shared.as_bytes());
    let nonce = random_nonce();
    let wrapped_key = seal(&wrap_key, &nonce, session_key)?;

    Ok(RecipientWrap {
        fingerprint: recipient.fingerprint(),
        x25519_ephemeral_pk: *ephemeral_public.as_bytes(),
        mlkem_ciphertext: mlkem_ciphertext.as_bytes().to_vec(),
        nonce,
        wrapped_key,
    })
}

/// Recovers a session key from a recipient wrap.
pub fn unwrap_recipient(
    wrap: &RecipientWrap,
    recipient: &RecipientSecretKey,
) -> VeilResult<[u8; 32]> {
    let ephemeral_public = X25519PublicKey::from(wrap.x25519_ephemeral_pk);
    let x25519_shared = recipient.x25519().diffie_hellman(&ephemeral_public);

    let mlkem_ciphertext = kyber768::Ciphertext::from_bytes(&wrap.mlkem_ciphertext)
        .map_err(|_| VeilError::Crypto("Invalid ML-KEM ciphertext".to_string()))?;
    let mlkem_shared = kyber768::decapsulate(&mlkem_ciphertext, recipient.mlkem());

    let wrap_key = combine_secrets(x25519_shared.as_bytes(), mlkem_shared.as_bytes());
    let key = open(&wrap_key, &wrap.nonce, &wrap.wrapped_key)?;
    key.try_into()
        .map_err(|_| VeilError::DecryptionFailed("unwrapped session key has wrong length".to_string()))
}

/// Derive a combined secret from X25519 and ML-KEM shared secrets.
fn combine_secrets(x25519_shared: &[u8], mlkem_shared: &[u8]) -> [u8; 32] {
    let mut combined_input = Vec::with_capacity(x25519_shared.len() + mlkem_shared.len());
    combined_input.extend_from_slice(x25519_shared);
    combined_input.extend_from_slice(mlkem_shared);

    derive_key(&combined_input, b"combined")
}

/// Derive a 32-byte key from a shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    let mut info = Vec::with_capacity(HKDF_INFO.len() + context.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(context);

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(&info, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PskId, RecipientSecretKey};

    #[test]
    fn test_header_and_body_share_a_stream() {
        let header = Header {
            version: WIRE_VERSION,
            channel_root: [1u8; 32],
            origin_root: [1u8; 32],
            ordinal: 7,
            session: SessionKeyAccess::Public,
        };
        let body = Body::Packet(Packet {
            nonce: [9u8; NONCE_SIZE],
            ciphertext: vec![1, 2, 3],
            last: true,
            checksum: PacketChecksum::None,
        });

        let mut stream = encode(&header).unwrap();
        stream.extend_from_slice(&encode(&body).unwrap());

        let (decoded, rest) = decode_header(&stream).unwrap();
        assert_eq!(decoded.ordinal, 7);
        match decode_body(rest).unwrap() {
            Body::Packet(p) => {
                assert_eq!(p.ciphertext, vec![1, 2, 3]);
                assert!(p.last);
            }
            Body::Announcement(_) => panic!("expected a packet"),
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = random_session_key();
        let nonce = random_nonce();
        let ciphertext = seal(&key, &nonce, b"masked payload").unwrap();
        assert_eq!(open(&key, &nonce, &ciphertext).unwrap(), b"masked payload");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let nonce = random_nonce();
        let ciphertext = seal(&random_session_key(), &nonce, b"x").unwrap();
        assert!(matches!(
            open(&random_session_key(), &nonce, &ciphertext),
            Err(VeilError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_public_session_key_depends_on_ordinal() {
        let root = [3u8; 32];
        assert_eq!(public_session_key(&root, 1), public_session_key(&root, 1));
        assert_ne!(public_session_key(&root, 1), public_session_key(&root, 2));
        assert_ne!(public_session_key(&root, 1), public_session_key(&[4u8; 32], 1));
    }

    #[test]
    fn test_group_wrap_roundtrip() {
        let psk = Psk::generate(PskId::random());
        let session = random_session_key();
        let wrap = wrap_for_group(&psk, &session).unwrap();
        assert_eq!(wrap.psk_id, psk.id().as_str());
        assert_eq!(unwrap_group(&wrap, psk.key()).unwrap(), session);
    }

    #[test]
    fn test_group_wrap_wrong_key_fails() {
        let wrap = wrap_for_group(&Psk::generate(PskId::random()), &random_session_key()).unwrap();
        let other = Psk::generate(PskId::random());
        assert!(unwrap_group(&wrap, other.key()).is_err());
    }

    #[test]
    fn test_recipient_wrap_roundtrip() {
        let recipient = RecipientSecretKey::generate();
        let session = random_session_key();
        let wrap = wrap_for_recipient(&recipient.public_key(), &session).unwrap();
        assert_eq!(wrap.fingerprint, recipient.fingerprint());
        assert_eq!(unwrap_recipient(&wrap, &recipient).unwrap(), session);
    }

    #[test]
    fn test_recipient_wrap_wrong_recipient_fails() {
        let recipient = RecipientSecretKey::generate();
        let wrap = wrap_for_recipient(&recipient.public_key(), &random_session_key()).unwrap();
        let intruder = RecipientSecretKey::generate();
        assert!(unwrap_recipient(&wrap, &intruder).is_err());
    }

    #[test]
    fn test_mac_binding() {
        let session = random_session_key();
        let binding = packet_binding(&[5u8; 32], 3, &[0u8; NONCE_SIZE], b"ct", false);
        let tag = mac_tag(&session, &binding);
        assert!(mac_verify(&session, &binding, &tag));

        let tampered = packet_binding(&[5u8; 32], 3, &[0u8; NONCE_SIZE], b"ct", true);
        assert!(!mac_verify(&session, &tampered, &tag));
        assert!(!mac_verify(&random_session_key(), &binding, &tag));
    }
}
