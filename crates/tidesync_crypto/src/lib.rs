//! # tidesync crypto
//!
//! Field-level encryption for synced records.
//!
//! ## Security Model
//!
//! - AES-256-GCM authenticated encryption, fresh random nonce per value
//! - One key per user, derived from an application secret with HKDF-SHA256
//! - Keys are zeroized on drop
//!
//! ## Envelopes
//!
//! - Strings: `"enc:" + base64(nonce || ciphertext || tag)`
//! - Binary blobs: `b"TSB1" || nonce || ciphertext || tag`
//!
//! ## Usage
//!
//! ```
//! use tidesync_crypto::{FieldCipher, FieldKey};
//!
//! let key = FieldKey::derive_for_user(b"app-secret", "user-42").unwrap();
//! let cipher = FieldCipher::new(key);
//!
//! let sealed = cipher.encrypt_string("private note").unwrap();
//! assert!(sealed.starts_with("enc:"));
//! assert_eq!(cipher.decrypt_string(&sealed).unwrap(), "private note");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod error;
mod key;

pub use cipher::{FieldCipher, BLOB_MAGIC, NONCE_SIZE, STRING_PREFIX, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{FieldKey, KEY_SIZE};
