//! AES-256-GCM field cipher.

use crate::error::{CryptoError, CryptoResult};
use crate::key::FieldKey;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Prefix marking an encrypted string value.
pub const STRING_PREFIX: &str = "enc:";
/// Magic header of an encrypted binary blob.
pub const BLOB_MAGIC: [u8; 4] = *b"TSB1";

/// Encrypts and decrypts individual field values for one user.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Creates a cipher for the given key.
    #[must_use]
    pub fn new(key: FieldKey) -> Self {
        // FieldKey is always exactly 32 bytes, which is what AES-256 expects.
        let key_array = GenericArray::from_slice(key.as_bytes());
        let cipher = Aes256Gcm::new(key_array);
        Self { cipher }
    }

    /// Creates the cipher for one user from the application secret.
    pub fn for_user(app_secret: &[u8], user_id: &str) -> CryptoResult<Self> {
        Ok(Self::new(FieldKey::derive_for_user(app_secret, user_id)?))
    }

    /// Returns true if the value is in the string envelope.
    pub fn is_encrypted_string(value: &str) -> bool {
        value.starts_with(STRING_PREFIX)
    }

    /// Returns true if the bytes are in the binary envelope.
    pub fn is_encrypted_blob(data: &[u8]) -> bool {
        data.len() >= BLOB_MAGIC.len() && data[..BLOB_MAGIC.len()] == BLOB_MAGIC
    }

    /// Encrypts a string into `"enc:" + base64(nonce || ciphertext || tag)`.
    pub fn encrypt_string(&self, plaintext: &str) -> CryptoResult<String> {
        let sealed = self.seal(plaintext.as_bytes())?;
        Ok(format!("{STRING_PREFIX}{}", STANDARD.encode(sealed)))
    }

    /// Decrypts a value produced by [`encrypt_string`](Self::encrypt_string).
    ///
    /// # Errors
    ///
    /// `NotEncrypted` if the prefix is missing; `DecryptionFailed` for bad
    /// base64, wrong key, tampering or invalid UTF-8.
    pub fn decrypt_string(&self, value: &str) -> CryptoResult<String> {
        let encoded = value
            .strip_prefix(STRING_PREFIX)
            .ok_or(CryptoError::NotEncrypted)?;
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::decryption_failed(format!("invalid base64: {e}")))?;
        let plaintext = self.open(&sealed)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::decryption_failed("plaintext is not UTF-8"))
    }

    /// Encrypts a blob into `b"TSB1" || nonce || ciphertext || tag`.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let sealed = self.seal(plaintext)?;
        let mut result = Vec::with_capacity(BLOB_MAGIC.len() + sealed.len());
        result.extend_from_slice(&BLOB_MAGIC);
        result.extend(sealed);
        Ok(result)
    }

    /// Decrypts a blob produced by [`encrypt_bytes`](Self::encrypt_bytes).
    pub fn decrypt_bytes(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        if !Self::is_encrypted_blob(data) {
            return Err(CryptoError::NotEncrypted);
        }
        self.open(&data[BLOB_MAGIC.len()..])
    }

    /// Returns `nonce || ciphertext || tag`.
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::encryption_failed("encryption error"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::decryption_failed("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| CryptoError::decryption_failed("decryption error"))
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
