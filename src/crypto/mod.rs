pub mod tpm_structs;
pub mod utility;

pub use utility::CryptoUtilityImpl;

use crate::secret::SecretBytes;
use crate::tpm::TpmError;
use crate::types::{CodecError, EncryptedData, EncryptedIdentityCredential};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("random generation failed: {0}")]
    Random(String),
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("RSA error: {0}")]
    Rsa(String),
    #[error("malformed input: {0}")]
    Format(String),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Cryptographic primitives used by the database and the orchestrator.
///
/// Public keys cross this boundary as DER: PKCS#1 RSAPublicKey where the
/// argument is named `public_key`, X.509 SubjectPublicKeyInfo where it is
/// named `public_key_info`.
pub trait CryptoUtility: Send + Sync {
    fn get_random(&self, num_bytes: usize) -> Result<Vec<u8>, CryptoError>;

    /// A fresh AES-256 key together with the same key sealed to PCR0.
    fn create_sealed_key(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Encrypt and MAC `data`, returning a serialized [`EncryptedData`] that
    /// embeds `sealed_key`.
    fn encrypt_data(
        &self,
        data: &[u8],
        aes_key: &SecretBytes,
        sealed_key: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Recover the AES key from a serialized [`EncryptedData`]. Also returns
    /// the sealed key so it can be reused for the next write.
    fn unseal_key(&self, encrypted: &[u8]) -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Verify the MAC, then decrypt. Nothing is decrypted on MAC failure.
    fn decrypt_data(
        &self,
        encrypted: &[u8],
        aes_key: &SecretBytes,
    ) -> Result<SecretBytes, CryptoError>;

    fn get_rsa_subject_public_key_info(&self, public_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn get_rsa_public_key(&self, public_key_info: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Produce what a TPM needs to recover `credential` in ActivateIdentity.
    fn encrypt_identity_credential(
        &self,
        credential: &[u8],
        ek_public_key_info: &[u8],
        aik_public_key_tpm_format: &[u8],
    ) -> Result<EncryptedIdentityCredential, CryptoError>;

    /// TPM_BOUND_DATA wrap then RSA-OAEP under `public_key_info`.
    fn encrypt_for_unbind(&self, public_key_info: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// PKCS#1 v1.5 verification of SHA-256(`data`). Malformed keys verify
    /// nothing.
    fn verify_signature(&self, public_key_info: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// Encrypt `data` to the ACA: the AES key is RSA-OAEP wrapped under the
    /// CA's public key instead of being sealed.
    fn encrypt_data_for_ca(
        &self,
        data: &[u8],
        ca_public_key_info: &[u8],
        key_id: &str,
    ) -> Result<EncryptedData, CryptoError>;
}
