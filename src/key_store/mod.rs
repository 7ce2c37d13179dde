pub mod pkcs11;

pub use pkcs11::{Pkcs11KeyStore, TokenLabelManager, TokenManager};

use crate::types::{KeyType, KeyUsage};

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key not found")]
    NotFound,
    #[error("unsupported key type: {0:?}")]
    Unsupported(KeyType),
    #[error("no token for user '{0}'")]
    NoToken(String),
    #[error("token: {0}")]
    Token(String),
    #[error("certificate: {0}")]
    Certificate(String),
}

impl From<cryptoki::error::Error> for KeyStoreError {
    fn from(e: cryptoki::error::Error) -> Self {
        KeyStoreError::Token(e.to_string())
    }
}

/// Per-user persistent storage for certified keys.
///
/// `read`/`write`/`delete` manage opaque blobs keyed by (user, name).
/// `register` turns a certified key into native token key objects.
pub trait KeyStore: Send {
    fn read(&self, username: &str, key_name: &str) -> Result<Vec<u8>, KeyStoreError>;

    fn write(&mut self, username: &str, key_name: &str, key_data: &[u8]) -> Result<(), KeyStoreError>;

    fn delete(&mut self, username: &str, key_name: &str) -> Result<(), KeyStoreError>;

    fn delete_by_prefix(&mut self, username: &str, key_prefix: &str) -> Result<(), KeyStoreError>;

    /// Install an RSA key as public/private key objects (and a certificate
    /// object when `certificate` is non-empty) sharing one object ID.
    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        username: &str,
        label: &str,
        key_type: KeyType,
        key_usage: KeyUsage,
        private_key_blob: &[u8],
        public_key_der: &[u8],
        certificate: &[u8],
    ) -> Result<(), KeyStoreError>;

    /// Add a bare certificate unless an identical one is already present.
    fn register_certificate(&mut self, username: &str, certificate: &[u8]) -> Result<(), KeyStoreError>;
}
