//! Request and reply values of the public attestation operations.

use crate::types::{CertificateProfile, EncryptedIdentityCredential, KeyType, KeyUsage, Quote};

/// Outcome of every operation. Only `Success` replies carry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Success,
    /// The TPM is not enabled or owned yet; retry later.
    NotReady,
    /// Requested material does not exist yet.
    NotAvailable,
    InvalidParameter,
    UnexpectedDeviceError,
    /// The CA refused; the reply's `server_error` says why.
    RequestDeniedByCa,
    CaNotAvailable,
}

/// An empty `username` addresses device-wide keys.
#[derive(Debug, Clone, Default)]
pub struct CreateGoogleAttestedKeyRequest {
    pub key_label: String,
    pub username: String,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    pub certificate_profile: CertificateProfile,
    /// Only used with [`CertificateProfile::ContentProtectionWithStableId`].
    pub origin: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateGoogleAttestedKeyReply {
    pub status: Status,
    pub server_error: String,
    /// PEM leaf certificate followed by its intermediates.
    pub certificate_chain: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetKeyInfoRequest {
    pub key_label: String,
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetKeyInfoReply {
    pub status: Status,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    /// DER SubjectPublicKeyInfo.
    pub public_key: Vec<u8>,
    pub certify_info: Vec<u8>,
    pub certify_info_signature: Vec<u8>,
    pub certificate: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetEndorsementInfoRequest {
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Default)]
pub struct GetEndorsementInfoReply {
    pub status: Status,
    /// DER SubjectPublicKeyInfo.
    pub ek_public_key: Vec<u8>,
    pub ek_certificate: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct GetAttestationKeyInfoRequest {
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Default)]
pub struct GetAttestationKeyInfoReply {
    pub status: Status,
    pub public_key: Option<Vec<u8>>,
    pub public_key_tpm_format: Option<Vec<u8>>,
    pub certificate: Option<Vec<u8>>,
    pub pcr0_quote: Option<Quote>,
    pub pcr1_quote: Option<Quote>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivateAttestationKeyRequest {
    pub key_type: KeyType,
    pub encrypted_certificate: EncryptedIdentityCredential,
    pub save_certificate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActivateAttestationKeyReply {
    pub status: Status,
    pub certificate: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCertifiableKeyRequest {
    pub key_label: String,
    pub username: String,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCertifiableKeyReply {
    pub status: Status,
    pub public_key: Vec<u8>,
    pub certify_info: Vec<u8>,
    pub certify_info_signature: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DecryptRequest {
    pub key_label: String,
    pub username: String,
    pub encrypted_data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DecryptReply {
    pub status: Status,
    pub decrypted_data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SignRequest {
    pub key_label: String,
    pub username: String,
    pub data_to_sign: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SignReply {
    pub status: Status,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterKeyWithChapsTokenRequest {
    pub key_label: String,
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterKeyWithChapsTokenReply {
    pub status: Status,
}

macro_rules! reply_from_status {
    ($($reply:ty),* $(,)?) => {
        $(
            impl From<Status> for $reply {
                fn from(status: Status) -> Self {
                    Self {
                        status,
                        ..Default::default()
                    }
                }
            }
        )*
    };
}

reply_from_status!(
    CreateGoogleAttestedKeyReply,
    GetKeyInfoReply,
    GetEndorsementInfoReply,
    GetAttestationKeyInfoReply,
    ActivateAttestationKeyReply,
    CreateCertifiableKeyReply,
    DecryptReply,
    SignReply,
    RegisterKeyWithChapsTokenReply,
);
