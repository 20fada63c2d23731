//! Message policy builder
//!
//! A message's policy is fixed before anything touches the wire: who can
//! read it (public, PSK groups, asymmetric recipients) and how it is
//! authenticated (nothing, a MAC, or a one-time signature). Invalid
//! combinations fail at build time, not at publish time.

use crate::error::{VeilError, VeilResult};
use crate::types::{Psk, RecipientPublicKey};

/// Who can read a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confidentiality {
    /// Masked under a key derivable from the channel id; readable by anyone
    /// following the channel.
    #[default]
    Public,
    /// Masked under a random session key wrapped for named groups and
    /// recipients.
    Encrypted,
}

/// How a message is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Authenticity {
    /// No checksum beyond the AEAD itself.
    #[default]
    None,
    /// Keyed MAC binding the packet to its session key.
    Mac,
    /// One-time leaf signature proving the publisher owns the origin tree.
    Signed,
}

/// A fully validated message, ready for a write stream.
#[derive(Debug, Clone)]
pub struct Message {
    confidentiality: Confidentiality,
    authenticity: Authenticity,
    groups: Vec<Psk>,
    recipients: Vec<RecipientPublicKey>,
    payload: Vec<u8>,
    last: bool,
}

impl Message {
    /// Starts a builder with the default policy: public, unauthenticated.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn confidentiality(&self) -> Confidentiality {
        self.confidentiality
    }

    pub fn authenticity(&self) -> Authenticity {
        self.authenticity
    }

    pub fn groups(&self) -> &[Psk] {
        &self.groups
    }

    pub fn recipients(&self) -> &[RecipientPublicKey] {
        &self.recipients
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this message closes its stream.
    pub fn is_last(&self) -> bool {
        self.last
    }
}

/// Builder assembling a message policy call by call.
///
/// `signed()` and `with_integrity()` displace each other; the latest call
/// wins. `groups()` and `recipients()` demand a prior `encrypted()` and a
/// non-empty key slice. Switching back with `public()` drops any key
/// material attached so far.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    confidentiality: Confidentiality,
    authenticity: Authenticity,
    groups: Vec<Psk>,
    recipients: Vec<RecipientPublicKey>,
    last: bool,
}

impl MessageBuilder {
    /// Marks the message public and clears attached groups and recipients.
    pub fn public(mut self) -> Self {
        self.confidentiality = Confidentiality::Public;
        self.groups.clear();
        self.recipients.clear();
        self
    }

    /// Marks the message encrypted. Key material is attached separately
    /// through [`groups`](Self::groups) and [`recipients`](Self::recipients).
    pub fn encrypted(mut self) -> Self {
        self.confidentiality = Confidentiality::Encrypted;
        self
    }

    /// Authenticates with a one-time leaf signature.
    pub fn signed(mut self) -> Self {
        self.authenticity = Authenticity::Signed;
        self
    }

    /// Authenticates with a keyed MAC.
    pub fn with_integrity(mut self) -> Self {
        self.authenticity = Authenticity::Mac;
        self
    }

    /// Marks this as the stream's final message.
    pub fn last(mut self) -> Self {
        self.last = true;
        self
    }

    /// Attaches pre-shared group keys.
    ///
    /// # Errors
    ///
    /// `InvalidBuilderState` without a prior `encrypted()`;
    /// `EmptyRecipientSet` for an empty slice.
    pub fn groups(mut self, keys: &[Psk]) -> VeilResult<Self> {
        if self.confidentiality != Confidentiality::Encrypted {
            return Err(VeilError::InvalidBuilderState(
                "groups() requires encrypted()".to_string(),
            ));
        }
        if keys.is_empty() {
            return Err(VeilError::EmptyRecipientSet("group"));
        }
        self.groups.extend_from_slice(keys);
        Ok(self)
    }

    /// Attaches asymmetric recipient keys.
    ///
    /// # Errors
    ///
    /// `InvalidBuilderState` without a prior `encrypted()`;
    /// `EmptyRecipientSet` for an empty slice.
    pub fn recipients(mut self, keys: &[RecipientPublicKey]) -> VeilResult<Self> {
        if self.confidentiality != Confidentiality::Encrypted {
            return Err(VeilError::InvalidBuilderState(
                "recipients() requires encrypted()".to_string(),
            ));
        }
        if keys.is_empty() {
            return Err(VeilError::EmptyRecipientSet("recipient"));
        }
        self.recipients.extend_from_slice(keys);
        Ok(self)
    }

    /// Validates the policy and seals the payload into a [`Message`].
    ///
    /// # Errors
    ///
    /// `MissingRecipients` if the message is encrypted but names no group
    /// and no recipient.
    pub fn create(self, payload: impl Into<Vec<u8>>) -> VeilResult<Message> {
        if self.confidentiality == Confidentiality::Encrypted
            && self.groups.is_empty()
            && self.recipients.is_empty()
        {
            return Err(VeilError::MissingRecipients);
        }
        Ok(Message {
            confidentiality: self.confidentiality,
            authenticity: self.authenticity,
            groups: self.groups,
            recipients: self.recipients,
            payload: payload.into(),
            last: self.last,
        })
    }
}
