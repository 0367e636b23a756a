//! Per-user field keys.

use crate::error::{CryptoError, CryptoResult};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Fixed HKDF salt; per-user separation comes from the info string.
const KEY_SALT: &[u8] = b"tidesync-field-salt-v1";
const KEY_INFO_PREFIX: &[u8] = b"tidesync-field-key-v1:";

/// A 256-bit field encryption key.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FieldKey {
    bytes: [u8; KEY_SIZE],
}

impl FieldKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::invalid_key_size(bytes.len(), KEY_SIZE));
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives the key for one user from the application secret.
    ///
    /// HKDF-SHA256 with the app secret as input key material and the user ID
    /// bound into the info string, so every user gets an independent key
    /// from the same secret.
    pub fn derive_for_user(app_secret: &[u8], user_id: &str) -> CryptoResult<Self> {
        if app_secret.is_empty() {
            return Err(CryptoError::key_derivation_failed("empty app secret"));
        }

        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), app_secret);

        let mut info = Vec::with_capacity(KEY_INFO_PREFIX.len() + user_id.len());
        info.extend_from_slice(KEY_INFO_PREFIX);
        info.extend_from_slice(user_id.as_bytes());

        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(&info, &mut bytes)
            .map_err(|_| CryptoError::key_derivation_failed("HKDF expand failed"))?;

        Ok(Self { bytes })
    }

    /// Returns the key bytes.
    ///
    /// # Security
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
