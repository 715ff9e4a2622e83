//! Nostr events and signing.
//!
//! An event's id is the SHA-256 of the canonical array
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is a BIP-340
//! Schnorr signature over that id.

use crate::error::{MonitorError, Result};
use crate::tags::TagSet;
use chrono::{DateTime, Utc};
use secp256k1::{All, Keypair, Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Event kinds emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Monitor profile metadata (kind 0)
    Profile,
    /// Relays this monitor writes to (kind 10002)
    RelayList,
    /// Monitor announcement with observation parameters (kind 10166)
    MonitorRegistration,
    /// Per-relay measurement, addressable by `d` (kind 30166)
    RelayMetrics,
}

impl EventKind {
    #[must_use]
    pub const fn number(self) -> u16 {
        match self {
            Self::Profile => 0,
            Self::RelayList => 10002,
            Self::MonitorRegistration => 10166,
            Self::RelayMetrics => 30166,
        }
    }
}

/// An event before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: TagSet,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(
        pubkey: impl Into<String>,
        created_at: DateTime<Utc>,
        kind: EventKind,
        tags: TagSet,
        content: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: created_at.timestamp(),
            kind: kind.number(),
            tags,
            content: content.into(),
        }
    }

    /// Serialized form hashed to obtain the id.
    pub fn canonical_json(&self) -> Result<String> {
        let json = serde_json::to_string(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?;
        Ok(json)
    }

    /// SHA-256 of the canonical serialization.
    pub fn id(&self) -> Result<[u8; 32]> {
        let canonical = self.canonical_json()?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    /// Attach an id and signature.
    #[must_use]
    pub fn into_signed(self, id: String, sig: String) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A signed event, ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: TagSet,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Value of the `d` tag, if present.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.tags.get("d").and_then(|t| t.value())
    }
}

/// Signing capability.
///
/// Shared by every endpoint loop, so implementations must be thread-safe.
pub trait EventSigner: Send + Sync {
    /// Hex x-only public key events are issued under.
    fn public_key(&self) -> &str;

    /// Compute the id and sign.
    fn sign(&self, event: UnsignedEvent) -> Result<Event>;
}

/// Signer backed by an in-memory secp256k1 keypair.
pub struct KeypairSigner {
    secp: Secp256k1<All>,
    keypair: Keypair,
    public_key: String,
}

impl KeypairSigner {
    /// Load a hex-encoded secret key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_str(&secp, secret.trim())
            .map_err(|e| MonitorError::InvalidConfig(format!("private key: {}", e)))?;
        let (xonly, _parity) = keypair.x_only_public_key();
        let public_key = hex::encode(xonly.serialize());

        Ok(Self {
            secp,
            keypair,
            public_key,
        })
    }
}

impl EventSigner for KeypairSigner {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(&self, event: UnsignedEvent) -> Result<Event> {
        if event.pubkey != self.public_key {
            return Err(MonitorError::SigningFailed(format!(
                "event issued by {} cannot be signed with key {}",
                event.pubkey, self.public_key
            )));
        }

        let digest = event.id()?;
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_schnorr_no_aux_rand(&message, &self.keypair);

        Ok(event.into_signed(hex::encode(digest), signature.to_string()))
    }
}
