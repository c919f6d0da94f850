//! Key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Label for deriving pairwise chain keys from the handshake secret
const PAIRWISE_LABEL: &[u8] = b"roomsealPairwiseV1";

/// Label for deriving the pickle encryption key
const PICKLE_LABEL: &[u8] = b"roomsealPickleV1";

/// Chain keys derived from a pairwise handshake.
///
/// `initiator` carries messages from the session initiator to the responder,
/// `responder` carries the replies.
pub struct PairwiseChains {
    /// Initiator-to-responder chain seed
    pub initiator: Zeroizing<[u8; 32]>,
    /// Responder-to-initiator chain seed
    pub responder: Zeroizing<[u8; 32]>,
}

/// Derive both pairwise chain seeds from the concatenated DH outputs.
///
/// Both sides feed the DH outputs in the same order, so they derive the same
/// pair of chains.
pub fn derive_pairwise_chains(shared_secret: &[u8]) -> PairwiseChains {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

    let mut okm = Zeroizing::new([0u8; 64]);
    let Ok(()) = hkdf.expand(PAIRWISE_LABEL, &mut okm[..]) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut initiator = Zeroizing::new([0u8; 32]);
    let mut responder = Zeroizing::new([0u8; 32]);
    initiator.copy_from_slice(&okm[..32]);
    responder.copy_from_slice(&okm[32..]);

    PairwiseChains { initiator, responder }
}

/// Derive the 32-byte pickle encryption key from a caller-supplied pickle key.
///
/// Any length of pickle key is accepted; an empty key is valid but offers no
/// protection.
pub fn derive_pickle_key(pickle_key: &[u8]) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, pickle_key);

    let mut key = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(PICKLE_LABEL, &mut key[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}
