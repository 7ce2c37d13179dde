//! Records shared between the crypto layer, the database, the key store and
//! the CA wire protocol.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    Rsa,
    Ecc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyUsage {
    #[default]
    Sign,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CertificateProfile {
    #[default]
    EnterpriseMachine,
    EnterpriseUser,
    ContentProtection,
    /// Origin-bound profile: the request carries the origin and a temporal index.
    ContentProtectionWithStableId,
}

/// Symmetrically encrypted blob with its MAC and the wrapped key needed to
/// recover the symmetric key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// TPM-sealed (or CA-wrapped) AES key.
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    /// HMAC-SHA512(iv || encrypted_data) keyed with the AES key.
    pub mac: Vec<u8>,
    pub encrypted_data: Vec<u8>,
    /// Identifies the CA key used for `wrapped_key`; empty when TPM-sealed.
    pub wrapping_key_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedIdentityCredential {
    /// TPM_ASYM_CA_CONTENTS encrypted under the endorsement key.
    pub asym_ca_contents: Vec<u8>,
    /// TPM_SYM_CA_ATTESTATION carrying the encrypted credential.
    pub sym_ca_attestation: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Signature over `quoted_data` by the identity key.
    pub quote: Vec<u8>,
    pub quoted_data: Vec<u8>,
    pub quoted_pcr_value: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after record")]
    Trailing(usize),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a record, requiring that it spans the whole buffer.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = ciborium::from_reader(&mut cursor).map_err(|e| CodecError::Decode(e.to_string()))?;
    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(CodecError::Trailing(bytes.len() - consumed));
    }
    Ok(value)
}
