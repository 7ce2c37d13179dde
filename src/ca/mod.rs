//! Device side of the Attestation CA protocol.

pub mod transport;

pub use transport::{HttpTransport, ReqwestTransport};

use crate::config::{ENROLL_PATH, SIGN_PATH};
use crate::types::{
    self, CertificateProfile, CodecError, EncryptedData, EncryptedIdentityCredential, Quote,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("HTTP status {0}")]
    Http(u16),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CaError {
    /// True when the CA could not be reached at all, as opposed to a
    /// malformed exchange.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CaError::Transport(_) | CaError::Http(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[default]
    Ok,
    ServerError,
    BadRequest,
    RejectedByPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollRequest {
    pub encrypted_endorsement_credential: EncryptedData,
    pub identity_public_key: Vec<u8>,
    pub pcr0_quote: Quote,
    pub pcr1_quote: Quote,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollResponse {
    pub status: ResponseStatus,
    pub detail: String,
    pub encrypted_identity_credential: EncryptedIdentityCredential,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateRequest {
    pub message_id: Vec<u8>,
    pub identity_credential: Vec<u8>,
    pub profile: CertificateProfile,
    /// Only for [`CertificateProfile::ContentProtectionWithStableId`].
    pub origin: Option<String>,
    pub temporal_index: Option<u32>,
    pub certified_public_key: Vec<u8>,
    pub certified_key_info: Vec<u8>,
    pub certified_key_proof: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateResponse {
    pub status: ResponseStatus,
    pub detail: String,
    pub message_id: Vec<u8>,
    pub certified_key_credential: Vec<u8>,
    pub intermediate_ca_cert: Vec<u8>,
    pub additional_intermediate_ca_cert: Vec<Vec<u8>>,
}

/// Serializes requests, posts them to the CA origin and parses replies.
pub struct CaClient {
    transport: Box<dyn HttpTransport>,
    origin: String,
}

impl CaClient {
    pub fn new(transport: Box<dyn HttpTransport>, origin: impl Into<String>) -> Self {
        Self {
            transport,
            origin: origin.into(),
        }
    }

    pub fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, CaError> {
        self.exchange(ENROLL_PATH, request)
    }

    pub fn sign(&self, request: &CertificateRequest) -> Result<CertificateResponse, CaError> {
        self.exchange(SIGN_PATH, request)
    }

    fn exchange<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, CaError> {
        let url = format!("{}{}", self.origin.trim_end_matches('/'), path);
        let body = types::encode(request)?;
        tracing::debug!(%url, bytes = body.len(), "sending CA request");
        let reply = self.transport.post(&url, body)?;
        Ok(types::decode(&reply)?)
    }
}
