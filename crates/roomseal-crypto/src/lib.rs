//! Roomseal Cryptographic Primitives
//!
//! Cryptographic building blocks for the roomseal session engine. Functions
//! are deterministic given their inputs: callers provide every random seed,
//! ephemeral secret and nonce suffix, which keeps the engine testable under a
//! seeded environment.
//!
//! # Key Hierarchy
//!
//! Two layers share one symmetric ratchet construction:
//!
//! ```text
//! Pairwise (1:1, key distribution only)
//!
//!   X25519 identity + ephemeral + one-time prekey
//!          │
//!          ▼ triple Diffie-Hellman
//!   Shared secret ──HKDF──► sending chain / receiving chain
//!                                  │
//!                                  ▼ SymmetricRatchet
//!                            Message keys ──► XChaCha20-Poly1305
//!
//! Group (room traffic)
//!
//!   Random chain seed + Ed25519 session key
//!          │
//!          ▼ SymmetricRatchet
//!   Message keys ──► XChaCha20-Poly1305 ──► Ed25519 signature
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are zeroized as soon as the next one is derived
//! - Message keys are zeroized after a single use
//! - One-time prekey secrets are consumed by exactly one inbound handshake
//!
//! Authenticity:
//! - Device key bundles and one-time prekeys are Ed25519 signed over their
//!   canonical JSON encoding
//! - Group messages are signed by the session's Ed25519 key, so holders of the
//!   session key cannot forge messages as the sender
//!
//! Secret Hygiene:
//! - Long-lived secrets live in [`SecureBuffer`], which is move-only and
//!   zeroed on drop
//! - Pickles are encrypted with a key derived from the caller's pickle key

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod canonical;
pub mod derivation;
pub mod encoding;
pub mod error;
pub mod group;
pub mod pairwise;
pub mod pickle;
pub mod ratchet;
pub mod secure_buffer;
pub mod signing;

pub use aead::{NONCE_RANDOM_SIZE, SealedMessage, open_message, seal_message};
pub use canonical::{canonical_json, canonical_json_value};
pub use error::CryptoError;
pub use group::{GroupMessage, GroupRatchetPickle, InboundGroupRatchet, OutboundGroupRatchet, SessionKey};
pub use pairwise::{PairwiseMessage, PairwiseSession, x25519_public_key};
pub use pickle::{open_pickle, seal_pickle};
pub use ratchet::{MessageKey, SymmetricRatchet};
pub use secure_buffer::SecureBuffer;
pub use signing::{signing_public_key, sign, verify_signature};
