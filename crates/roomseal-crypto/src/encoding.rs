//! Byte encodings used on the wire: unpadded base64 for keys and bodies,
//! CBOR for structured binary payloads.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CryptoError;

/// Encode bytes as unpadded standard base64.
pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decode unpadded (or padded) standard base64.
pub fn decode_b64(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| CryptoError::Malformed { reason: format!("base64: {e}") })
}

/// Decode a base64 string that must hold exactly 32 bytes (a public key).
pub fn decode_key(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode_b64(encoded)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength { expected: 32, actual })
}

/// Serialize a value to CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    let Ok(()) = ciborium::into_writer(value, &mut buffer) else {
        unreachable!("CBOR serialization into a Vec cannot fail for plain data types");
    };
    buffer
}

/// Deserialize a value from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    ciborium::from_reader(bytes).map_err(|e| CryptoError::Malformed { reason: format!("cbor: {e}") })
}
