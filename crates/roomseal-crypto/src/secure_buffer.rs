//! Move-only byte buffer for secret material.

use std::fmt;

use zeroize::Zeroize;

/// Owned buffer for secret bytes (seeds, private keys, pickled state).
///
/// The buffer is deliberately not `Clone`: there is exactly one copy of the
/// secret per handle, and it is overwritten with zeros when the handle is
/// wiped or dropped.
///
/// # Invariants
///
/// - Length is fixed at construction
/// - Contents are zero after [`wipe()`](Self::wipe) and after drop
pub struct SecureBuffer {
    bytes: Box<[u8]>,
}

impl SecureBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { bytes: vec![0u8; len].into_boxed_slice() }
    }

    /// Take ownership of `bytes`, zeroizing the caller's copy.
    pub fn from_slice_wiping(bytes: &mut [u8]) -> Self {
        let buffer = Self { bytes: bytes.to_vec().into_boxed_slice() };
        bytes.zeroize();
        buffer
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read access to the secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Write access to the secret bytes (used to fill from an RNG).
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Borrow a fixed-size window of the buffer.
    ///
    /// Returns `None` if the window falls outside the buffer.
    pub fn array_at<const N: usize>(&self, offset: usize) -> Option<&[u8; N]> {
        let end = offset.checked_add(N)?;
        self.bytes.get(offset..end)?.try_into().ok()
    }

    /// Overwrite the contents with zeros, keeping the allocation.
    pub fn wipe(&mut self) {
        Zeroize::zeroize(&mut self.bytes[..]);
    }

    /// True if every byte is zero.
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}
