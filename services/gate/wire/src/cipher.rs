//! Encryption hooks applied to frame bodies.
//!
//! Sessions carry an optional encryptor/decryptor pair. The codec calls the
//! encryptor after compression on the way out, and the decryptor before
//! decompression on the way in.

use crate::WireError;
use std::fmt;
use std::sync::Arc;

/// Outbound body transform
pub trait Encryptor: Send + Sync {
    /// Encrypt `plain`, returning the bytes to put on the wire
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, WireError>;
}

/// Inbound body transform
pub trait Decryptor: Send + Sync {
    /// Decrypt bytes read from the wire
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, WireError>;
}

/// Encrypt/decrypt hook pair installed on a session
#[derive(Clone, Default)]
pub struct CipherHooks {
    /// Applied to outbound bodies
    pub encryptor: Option<Arc<dyn Encryptor>>,
    /// Applied to inbound bodies carrying the Encrypt flag
    pub decryptor: Option<Arc<dyn Decryptor>>,
}

impl CipherHooks {
    /// Hooks with both directions set
    pub fn new(encryptor: Arc<dyn Encryptor>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            encryptor: Some(encryptor),
            decryptor: Some(decryptor),
        }
    }

    /// Install one object for both directions
    pub fn symmetric<C>(cipher: Arc<C>) -> Self
    where
        C: Encryptor + Decryptor + 'static,
    {
        Self {
            encryptor: Some(cipher.clone()),
            decryptor: Some(cipher),
        }
    }

    /// Whether neither direction is configured
    pub fn is_empty(&self) -> bool {
        self.encryptor.is_none() && self.decryptor.is_none()
    }
}

impl fmt::Debug for CipherHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherHooks")
            .field("encryptor", &self.encryptor.is_some())
            .field("decryptor", &self.decryptor.is_some())
            .finish()
    }
}

#[cfg(feature = "crypto")]
pub use aead::ChaChaCipher;

#[cfg(feature = "crypto")]
mod aead {
    use super::{Decryptor, Encryptor};
    use crate::WireError;
    use chacha20poly1305::aead::{Aead, KeyInit};
    use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
    use rand::RngCore;

    const NONCE_LEN: usize = 12;

    /// ChaCha20-Poly1305 with a random nonce prefixed to each body
    pub struct ChaChaCipher {
        aead: ChaCha20Poly1305,
    }

    impl ChaChaCipher {
        /// Create a cipher from a 32-byte key
        pub fn new(key: &[u8; 32]) -> Self {
            Self {
                aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            }
        }
    }

    impl Encryptor for ChaChaCipher {
        fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, WireError> {
            let mut nonce = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);

            let sealed = self
                .aead
                .encrypt(Nonce::from_slice(&nonce), plain)
                .map_err(|e| WireError::Encrypt(e.to_string()))?;

            let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&sealed);
            Ok(out)
        }
    }

    impl Decryptor for ChaChaCipher {
        fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, WireError> {
            if cipher.len() < NONCE_LEN {
                return Err(WireError::Decrypt("body shorter than nonce".into()));
            }
            let (nonce, sealed) = cipher.split_at(NONCE_LEN);
            self.aead
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|e| WireError::Decrypt(e.to_string()))
        }
    }

}
