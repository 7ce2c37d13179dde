pub mod context;
pub mod identity;
pub mod keys;
pub mod seal;
pub mod utility;

pub use context::TpmContext;
pub use utility::TpmUtilityImpl;

use crate::crypto::tpm_structs::OAEP_LABEL;
use crate::secret::SecretBytes;
use crate::types::{KeyType, KeyUsage, Quote};

#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("TPM context error: {0}")]
    Context(String),
    #[error("TPM not initialized")]
    NotInitialized,
    #[error("TPM key error: {0}")]
    Key(String),
    #[error("TPM seal error: {0}")]
    Seal(String),
    #[error("TPM identity error: {0}")]
    Identity(String),
    #[error("unsupported key type: {0:?}")]
    Unsupported(KeyType),
    #[error("TPM 1.2 identity credential cannot be activated by this TPM")]
    LegacyCredential,
    #[error("malformed blob: {0}")]
    Blob(String),
    #[error("TPM error: {0}")]
    Other(String),
}

impl From<tss_esapi::Error> for TpmError {
    fn from(e: tss_esapi::Error) -> Self {
        TpmError::Other(e.to_string())
    }
}

/// Output of [`TpmUtility::create_certified_key`].
#[derive(Debug, Clone, Default)]
pub struct CertifiedKeyMaterial {
    /// TPM-wrapped private key; only meaningful to the TPM that made it.
    pub key_blob: Vec<u8>,
    /// DER-encoded PKCS#1 RSAPublicKey.
    pub public_key: Vec<u8>,
    pub public_key_tpm_format: Vec<u8>,
    /// Certification statement produced by the identity key.
    pub certify_info: Vec<u8>,
    /// Identity-key signature over `certify_info`.
    pub proof: Vec<u8>,
}

/// Output of [`TpmUtility::create_identity_key`].
#[derive(Debug, Clone, Default)]
pub struct IdentityKeyMaterial {
    pub key_blob: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_tpm_format: Vec<u8>,
}

/// Abstraction over the physical TPM.
///
/// Nothing here retries: a failed command is reported once and the caller
/// decides what to do with it.
pub trait TpmUtility: Send + Sync {
    /// Connect to the TPM. Must succeed before any other call does.
    fn initialize(&self) -> Result<(), TpmError>;

    /// Live enablement/ownership check; never cached.
    fn is_tpm_ready(&self) -> bool;

    /// Seal `data` to the storage root key and the current value of PCR0.
    fn seal_to_pcr0(&self, data: &[u8]) -> Result<Vec<u8>, TpmError>;

    /// Fails if PCR0 has changed since the blob was sealed.
    fn unseal(&self, sealed: &[u8]) -> Result<SecretBytes, TpmError>;

    /// Create a non-migratable RSA-2048 key and certify it with the identity
    /// key, binding `external_data` into the certification.
    fn create_certified_key(
        &self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKeyMaterial, TpmError>;

    /// Recover the identity credential from the two CA-encrypted blobs.
    fn activate_identity(
        &self,
        delegate_blob: &[u8],
        delegate_secret: &[u8],
        identity_key_blob: &[u8],
        asym_ca_contents: &[u8],
        sym_ca_attestation: &[u8],
    ) -> Result<Vec<u8>, TpmError>;

    /// PKCS#1 v1.5 signature over SHA-256(`data`).
    fn sign(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError>;

    /// Inverse of `CryptoUtility::encrypt_for_unbind`.
    fn unbind(&self, key_blob: &[u8], bound_data: &[u8]) -> Result<SecretBytes, TpmError>;

    /// OAEP label `unbind` decrypts with. Data bound for this TPM must be
    /// encrypted under the same label.
    fn unbind_label(&self) -> &'static str {
        OAEP_LABEL
    }

    /// DER-encoded PKCS#1 RSAPublicKey of the endorsement key.
    fn get_endorsement_public_key(&self) -> Result<Vec<u8>, TpmError>;

    fn get_endorsement_certificate(&self) -> Result<Vec<u8>, TpmError>;

    fn create_identity_key(&self) -> Result<IdentityKeyMaterial, TpmError>;

    fn quote_pcr(
        &self,
        pcr_index: u8,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<Quote, TpmError>;
}
