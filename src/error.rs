#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("TPM: {0}")]
    Tpm(#[from] crate::tpm::TpmError),
    #[error("Crypto: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("Database: {0}")]
    Database(#[from] crate::database::DatabaseError),
    #[error("Key store: {0}")]
    KeyStore(#[from] crate::key_store::KeyStoreError),
    #[error("CA: {0}")]
    Ca(#[from] crate::ca::CaError),
    #[error("Codec: {0}")]
    Codec(#[from] crate::types::CodecError),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
