//! The acting user and their field cipher.

use parking_lot::RwLock;
use std::sync::Arc;
use tidesync_crypto::FieldCipher;
use tracing::warn;

/// A signed-in user.
#[derive(Debug)]
pub struct SyncSession {
    user_id: String,
    cipher: Option<FieldCipher>,
}

impl SyncSession {
    /// Creates a session, deriving the user's field key from `app_secret`.
    ///
    /// Without a usable secret the session has no cipher and encrypted
    /// fields travel as plaintext.
    pub fn new(user_id: impl Into<String>, app_secret: Option<&[u8]>) -> Self {
        let user_id = user_id.into();
        let cipher = app_secret.and_then(|secret| {
            FieldCipher::for_user(secret, &user_id)
                .map_err(|e| warn!(user_id = %user_id, error = %e, "field key derivation failed"))
                .ok()
        });
        Self { user_id, cipher }
    }

    /// Creates a session with an explicit cipher.
    pub fn with_cipher(user_id: impl Into<String>, cipher: FieldCipher) -> Self {
        Self {
            user_id: user_id.into(),
            cipher: Some(cipher),
        }
    }

    /// User ID.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Field cipher, if encryption is available.
    pub fn cipher(&self) -> Option<&FieldCipher> {
        self.cipher.as_ref()
    }
}

/// Shared slot holding the current session.
#[derive(Debug, Default)]
pub struct SessionCell {
    current: RwLock<Option<Arc<SyncSession>>>,
}

impl SessionCell {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current session.
    pub fn current(&self) -> Option<Arc<SyncSession>> {
        self.current.read().clone()
    }

    /// Replaces the current session.
    pub fn set(&self, session: SyncSession) {
        *self.current.write() = Some(Arc::new(session));
    }

    /// Removes the current session.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}
