//! Tryte strings and byte transcoding
//!
//! Everything that crosses the ledger is expressed in trytes: the 27-symbol
//! alphabet `9A..Z`. Bytes map to tryte pairs (low digit first), so every
//! encoded payload has even length and each pair decodes to at most 255.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{VeilError, VeilResult};

/// The 27 tryte symbols. `9` is the zero digit.
pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of trytes in an address checksum.
pub const CHECKSUM_TRYTES: usize = 9;

const RADIX: u16 = 27;

/// A validated string of tryte symbols.
///
/// Construction checks every character against the alphabet, so holding a
/// `Trytes` means the content is well-formed. Empty strings are valid trytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Trytes(String);

impl Trytes {
    /// Validates `s` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `VeilError::InvalidTrytes` if any character is outside `9A..Z`.
    pub fn new(s: impl Into<String>) -> VeilResult<Self> {
        let s = s.into();
        for (pos, c) in s.bytes().enumerate() {
            if tryte_index(c).is_none() {
                return Err(VeilError::InvalidTrytes(format!(
                    "character {:?} at position {} is not a tryte",
                    c as char, pos
                )));
            }
        }
        Ok(Self(s))
    }

    /// The empty tryte string.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Wraps a string already known to be valid trytes (slices of validated
    /// tryte strings, alphabet-mapped output).
    pub(crate) fn from_validated(s: String) -> Self {
        debug_assert!(s.bytes().all(|c| tryte_index(c).is_some()));
        Self(s)
    }

    /// `len` zero digits (`9` repeated).
    pub fn null(len: usize) -> Self {
        Self("9".repeat(len))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends another tryte string in place.
    pub fn push(&mut self, other: &Trytes) {
        self.0.push_str(&other.0);
    }

    /// Splits into pieces of at most `size` trytes, in order.
    pub fn chunks(&self, size: usize) -> Vec<Trytes> {
        self.0
            .as_bytes()
            .chunks(size.max(1))
            .map(|c| Self(String::from_utf8_lossy(c).into_owned()))
            .collect()
    }
}

impl std::fmt::Display for Trytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Trytes {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Trytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Trytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Trytes::new(s).map_err(serde::de::Error::custom)
    }
}

/// Index of a tryte symbol in the alphabet, or `None` for foreign characters.
fn tryte_index(tryte: u8) -> Option<u8> {
    match tryte {
        b'9' => Some(0),
        b'A'..=b'Z' => Some(tryte - b'A' + 1),
        _ => None,
    }
}

/// Encodes bytes as trytes, two per byte with the low digit first.
pub fn bytes_to_trytes(bytes: &[u8]) -> Trytes {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let low = (b as u16 % RADIX) as usize;
        let high = (b as u16 / RADIX) as usize;
        out.push(TRYTE_ALPHABET[low] as char);
        out.push(TRYTE_ALPHABET[high] as char);
    }
    Trytes(out)
}

/// Decodes a tryte-pair encoding back to bytes.
///
/// # Errors
///
/// Returns `VeilError::Transcoding` for odd-length input or for a pair whose
/// value exceeds a byte (e.g. `ZZ`). Such strings are valid trytes but were
/// never produced by `bytes_to_trytes`.
pub fn trytes_to_bytes(trytes: &Trytes) -> VeilResult<Vec<u8>> {
    let raw = trytes.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(VeilError::Transcoding(format!(
            "tryte length {} is odd, expected pairs",
            raw.len()
        )));
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        // Alphabet membership is guaranteed by the Trytes invariant.
        let low = tryte_index(pair[0]).unwrap_or(0) as u16;
        let high = tryte_index(pair[1]).unwrap_or(0) as u16;
        let value = low + high * RADIX;
        if value > u8::MAX as u16 {
            return Err(VeilError::Transcoding(format!(
                "tryte pair {}{} decodes to {}, not a byte",
                pair[0] as char, pair[1] as char, value
            )));
        }
        out.push(value as u8);
    }
    Ok(out)
}

/// Encodes UTF-8 text as trytes.
pub fn text_to_trytes(text: &str) -> Trytes {
    bytes_to_trytes(text.as_bytes())
}

/// Decodes trytes produced by [`text_to_trytes`] back to text.
pub fn trytes_to_text(trytes: &Trytes) -> VeilResult<String> {
    let bytes = trytes_to_bytes(trytes)?;
    String::from_utf8(bytes)
        .map_err(|e| VeilError::Transcoding(format!("decoded bytes are not UTF-8: {}", e)))
}

/// Nine checksum trytes over a tryte string, from its blake3 digest.
pub fn checksum_trytes(trytes: &Trytes) -> Trytes {
    let digest = blake3::hash(trytes.as_bytes());
    let mut out = String::with_capacity(CHECKSUM_TRYTES);
    for &b in digest.as_bytes().iter().take(CHECKSUM_TRYTES) {
        out.push(TRYTE_ALPHABET[(b as u16 % RADIX) as usize] as char);
    }
    Trytes(out)
}

/// `len` random trytes drawn uniformly from the alphabet.
pub fn random_trytes(len: usize) -> Trytes {
    use rand::RngCore;

    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(len);
    for b in bytes {
        out.push(TRYTE_ALPHABET[(b as u16 % RADIX) as usize] as char);
    }
    Trytes(out)
}
