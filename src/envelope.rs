//! Ciphertext envelope and its wire encoding.
//!
//! ## Wire Format
//!
//! ```text
//! version          u8     (currently 1)
//! flags            u8     RATCHET_KEY | PRE_KEY | ONE_TIME_PRE_KEY
//! sender id        u8 length || UTF-8 bytes
//! ratchet key      32 bytes        (RATCHET_KEY, always set)
//! previous length  u32 LE
//! counter          u32 LE
//! pre-key section                  (if PRE_KEY)
//!   identity key   32 bytes
//!   base key       32 bytes
//!   signed pre-key id  u32 LE
//!   one-time pre-key id u32 LE     (if ONE_TIME_PRE_KEY)
//! ciphertext       remaining bytes, Poly1305 tag last
//! ```
//!
//! Every envelope carries the sender's ratchet key. The receiver tells a new ratchet
//! key from a continuing chain by comparing it against the chains it already knows,
//! which keeps working when the first message of a chain is lost or delayed. An
//! envelope without the RATCHET_KEY flag is rejected.
//!
//! Everything before the ciphertext is the header. It is authenticated as associated
//! data, so any header modification fails decryption just like a modified payload.
//! The byte string travels as standard base64.

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::session_store::PeerId;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

pub const VERSION: u8 = 1;

const FLAG_RATCHET_KEY: u8 = 0b0000_0001;
const FLAG_PRE_KEY: u8 = 0b0000_0010;
const FLAG_ONE_TIME_PRE_KEY: u8 = 0b0000_0100;
const KNOWN_FLAGS: u8 = FLAG_RATCHET_KEY | FLAG_PRE_KEY | FLAG_ONE_TIME_PRE_KEY;

/// Establishment data an initiator attaches until the responder has replied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InitialMessage {
    /// Initiator's identity public key
    pub identity_key: PublicKey,

    /// Initiator's ephemeral (base) key used in the key agreement
    pub base_key: PublicKey,

    /// Responder's signed prekey the initiator used
    pub signed_pre_key_id: u32,

    /// Responder's one-time prekey the initiator used, if any
    pub one_time_pre_key_id: Option<u32>,
}

/// Serialized ciphertext unit exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    /// Local id of the party that produced the envelope
    pub sender_id: PeerId,

    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,

    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,

    /// Position of this message in its sending chain
    pub counter: u32,

    pub initial_message: Option<InitialMessage>,

    /// Encrypted payload with the authentication tag appended
    pub ciphertext: Vec<u8>,
}

impl CiphertextEnvelope {
    /// Header bytes, used as associated data
    #[must_use]
    pub fn header_bytes(&self) -> Vec<u8> {
        let sender = self.sender_id.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(2 + 1 + sender.len() + 32 + 8 + 72);

        let mut flags = FLAG_RATCHET_KEY;
        if let Some(initial) = &self.initial_message {
            flags |= FLAG_PRE_KEY;
            if initial.one_time_pre_key_id.is_some() {
                flags |= FLAG_ONE_TIME_PRE_KEY;
            }
        }

        bytes.push(VERSION);
        bytes.push(flags);

        // PeerId caps its length at MAX_PEER_ID_LEN, which fits a u8.
        bytes.push(u8::try_from(sender.len()).unwrap_or(u8::MAX));
        bytes.extend_from_slice(sender);

        bytes.extend_from_slice(self.ratchet_key.as_bytes());
        bytes.extend_from_slice(&self.previous_chain_length.to_le_bytes());
        bytes.extend_from_slice(&self.counter.to_le_bytes());

        if let Some(initial) = &self.initial_message {
            bytes.extend_from_slice(initial.identity_key.as_bytes());
            bytes.extend_from_slice(initial.base_key.as_bytes());
            bytes.extend_from_slice(&initial.signed_pre_key_id.to_le_bytes());
            if let Some(id) = initial.one_time_pre_key_id {
                bytes.extend_from_slice(&id.to_le_bytes());
            }
        }

        bytes
    }

    /// Serialize for transmission
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes();
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize an envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        if reader.u8()? != VERSION {
            return Err(Error::InvalidEnvelope("unsupported version"));
        }

        let flags = reader.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::InvalidEnvelope("unknown flags"));
        }
        if flags & FLAG_RATCHET_KEY == 0 {
            return Err(Error::InvalidEnvelope("missing ratchet key"));
        }
        if flags & FLAG_ONE_TIME_PRE_KEY != 0 && flags & FLAG_PRE_KEY == 0 {
            return Err(Error::InvalidEnvelope("one-time prekey without prekey section"));
        }

        let sender_len = usize::from(reader.u8()?);
        let sender = std::str::from_utf8(reader.take(sender_len)?)
            .map_err(|_| Error::InvalidEnvelope("sender id is not UTF-8"))?;
        let sender_id =
            PeerId::new(sender).map_err(|_| Error::InvalidEnvelope("empty sender id"))?;

        let ratchet_key = reader.public_key()?;
        let previous_chain_length = reader.u32()?;
        let counter = reader.u32()?;

        let initial_message = if flags & FLAG_PRE_KEY != 0 {
            let identity_key = reader.public_key()?;
            let base_key = reader.public_key()?;
            let signed_pre_key_id = reader.u32()?;
            let one_time_pre_key_id = if flags & FLAG_ONE_TIME_PRE_KEY != 0 {
                Some(reader.u32()?)
            } else {
                None
            };
            Some(InitialMessage {
                identity_key,
                base_key,
                signed_pre_key_id,
                one_time_pre_key_id,
            })
        } else {
            None
        };

        let ciphertext = reader.rest();
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::InvalidEnvelope("ciphertext shorter than tag"));
        }

        Ok(Self {
            sender_id,
            ratchet_key,
            previous_chain_length,
            counter,
            initial_message,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Transport-safe text encoding
    #[must_use]
    pub fn encode(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_bytes(&bytes)
    }
}

/// Bounds-checked cursor over envelope bytes
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::InvalidEnvelope("truncated header"));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| Error::InvalidEnvelope("truncated header"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn public_key(&mut self) -> Result<PublicKey> {
        PublicKey::from_slice(self.take(PublicKey::SIZE)?)
    }

    fn rest(self) -> &'a [u8] {
        self.bytes
    }
}
