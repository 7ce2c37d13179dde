use super::interface::*;
use super::{pem, temporal};
use crate::ca::{CaClient, CaError, CertificateRequest, CertificateResponse, EnrollRequest, ResponseStatus};
use crate::config::{NONCE_SIZE, PCR_BOOT_MODE, PCR_HWID, ServiceConfig};
use crate::crypto::CryptoUtility;
use crate::database::{CertifiedKey, Database, IdentityBinding, IdentityKey};
use crate::error::{Error, Result};
use crate::key_store::{KeyStore, KeyStoreError};
use crate::tpm::TpmUtility;
use crate::types::{self, CertificateProfile, KeyType, KeyUsage};
use std::sync::Arc;

/// Why a protocol sequence stopped early.
struct Failure {
    status: Status,
    server_error: String,
}

impl Failure {
    fn status(status: Status) -> Self {
        Self {
            status,
            server_error: String::new(),
        }
    }

    fn device(step: &str, error: impl std::fmt::Display) -> Self {
        tracing::error!(step, %error, "attestation step failed");
        Self::status(Status::UnexpectedDeviceError)
    }

    /// A denial the CA did not explain is not reported as a CA decision.
    fn denied(detail: String) -> Self {
        if detail.is_empty() {
            tracing::error!("CA denied the request without detail");
            return Self::status(Status::UnexpectedDeviceError);
        }
        tracing::warn!(%detail, "request denied by CA");
        Self {
            status: Status::RequestDeniedByCa,
            server_error: detail,
        }
    }

    fn ca(step: &str, error: CaError) -> Self {
        if error.is_unavailable() {
            tracing::warn!(step, %error, "CA not available");
            Self::status(Status::CaNotAvailable)
        } else {
            Self::device(step, error)
        }
    }
}

/// State owned by the worker thread. Every method runs to completion
/// without yielding; TPM, CA and disk calls block.
pub(crate) struct Worker {
    tpm: Arc<dyn TpmUtility>,
    crypto: Arc<dyn CryptoUtility>,
    pub(crate) database: Box<dyn Database>,
    key_store: Box<dyn KeyStore>,
    ca: CaClient,
    config: ServiceConfig,
}

impl Worker {
    pub(crate) fn new(
        tpm: Arc<dyn TpmUtility>,
        crypto: Arc<dyn CryptoUtility>,
        database: Box<dyn Database>,
        key_store: Box<dyn KeyStore>,
        ca: CaClient,
        config: ServiceConfig,
    ) -> Self {
        Self {
            tpm,
            crypto,
            database,
            key_store,
            ca,
            config,
        }
    }

    pub(crate) fn initialize(&mut self) {
        if let Err(e) = self.tpm.initialize() {
            tracing::error!(error = %e, "TPM initialization failed");
        }
        if let Err(e) = self.database.initialize() {
            tracing::error!(error = %e, "database initialization failed");
        }
        self.prepare_for_enrollment();
    }

    /// Create the identity key and gather what enrollment will need.
    fn prepare_for_enrollment(&mut self) {
        if !self.tpm.is_tpm_ready() {
            tracing::info!("TPM not ready; enrollment preparation deferred");
            return;
        }
        if self.database.get().identity_key.is_some() {
            return;
        }
        match self.try_prepare_for_enrollment() {
            Ok(()) => tracing::info!("prepared for enrollment"),
            Err(e) => tracing::error!(error = %e, "enrollment preparation failed"),
        }
    }

    fn try_prepare_for_enrollment(&mut self) -> Result<()> {
        let ek_public_key = self.tpm.get_endorsement_public_key()?;
        let ek_certificate = self.tpm.get_endorsement_certificate().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "no endorsement certificate");
            Vec::new()
        });
        let identity = self.tpm.create_identity_key()?;
        let nonce = self.crypto.get_random(NONCE_SIZE)?;
        let pcr0_quote = self.tpm.quote_pcr(PCR_BOOT_MODE, &identity.key_blob, &nonce)?;
        let pcr1_quote = self.tpm.quote_pcr(PCR_HWID, &identity.key_blob, &nonce)?;

        let encrypted_credential = match &self.config.ca_public_key {
            Some(ca_key) if !ek_certificate.is_empty() => Some(self.crypto.encrypt_data_for_ca(
                &ek_certificate,
                ca_key,
                &self.config.ca_key_id,
            )?),
            _ => {
                tracing::warn!("endorsement credential not encrypted for the CA; enrollment unavailable");
                None
            }
        };

        let mut db = self.database.edit();
        db.credentials.endorsement_public_key = ek_public_key;
        db.credentials.endorsement_credential = ek_certificate;
        db.credentials.default_encrypted_endorsement_credential = encrypted_credential;
        db.identity_binding = Some(IdentityBinding {
            identity_public_key_tpm_format: identity.public_key_tpm_format,
            identity_public_key: identity.public_key.clone(),
        });
        db.identity_key = Some(IdentityKey {
            identity_key_blob: identity.key_blob,
            identity_public_key: identity.public_key,
            identity_credential: Vec::new(),
        });
        db.pcr0_quote = Some(pcr0_quote);
        db.pcr1_quote = Some(pcr1_quote);
        db.save()?;
        Ok(())
    }

    fn require_rsa(key_type: KeyType) -> std::result::Result<(), Failure> {
        if key_type == KeyType::Rsa {
            Ok(())
        } else {
            tracing::warn!(?key_type, "unsupported key type");
            Err(Failure::status(Status::InvalidParameter))
        }
    }

    pub(crate) fn create_google_attested_key(
        &mut self,
        request: &CreateGoogleAttestedKeyRequest,
    ) -> CreateGoogleAttestedKeyReply {
        match self.try_create_google_attested_key(request) {
            Ok(certificate_chain) => CreateGoogleAttestedKeyReply {
                status: Status::Success,
                server_error: String::new(),
                certificate_chain,
            },
            Err(failure) => CreateGoogleAttestedKeyReply {
                status: failure.status,
                server_error: failure.server_error,
                certificate_chain: String::new(),
            },
        }
    }

    fn try_create_google_attested_key(
        &mut self,
        request: &CreateGoogleAttestedKeyRequest,
    ) -> std::result::Result<String, Failure> {
        if !self.tpm.is_tpm_ready() {
            return Err(Failure::status(Status::NotReady));
        }
        Self::require_rsa(request.key_type)?;
        if !self.database.get().is_enrolled() {
            self.enroll()?;
        }

        let key = self
            .create_key(
                &request.username,
                &request.key_label,
                request.key_type,
                request.key_usage,
            )
            .map_err(|e| Failure::device("create certified key", e))?;
        let certificate_request = self
            .create_certificate_request(
                &request.username,
                &key,
                request.certificate_profile,
                &request.origin,
            )
            .map_err(|e| Failure::device("create certificate request", e))?;
        let response = self
            .ca
            .sign(&certificate_request)
            .map_err(|e| Failure::ca("sign", e))?;
        self.finish_certificate_request(
            response,
            &certificate_request.message_id,
            &request.username,
            &request.key_label,
            key,
        )
    }

    fn enroll(&mut self) -> std::result::Result<(), Failure> {
        let request = self
            .create_enroll_request()
            .map_err(|e| Failure::device("create enroll request", e))?;
        let response = self.ca.enroll(&request).map_err(|e| Failure::ca("enroll", e))?;
        if response.status != ResponseStatus::Ok {
            return Err(Failure::denied(response.detail));
        }

        let db = self.database.get();
        let identity_key_blob = db
            .identity_key
            .as_ref()
            .map(|key| key.identity_key_blob.clone())
            .unwrap_or_default();
        let credential = self
            .tpm
            .activate_identity(
                &db.delegate.blob,
                &db.delegate.secret,
                &identity_key_blob,
                &response.encrypted_identity_credential.asym_ca_contents,
                &response.encrypted_identity_credential.sym_ca_attestation,
            )
            .map_err(|e| Failure::device("activate identity", e))?;

        let mut db = self.database.edit();
        db.identity_key
            .get_or_insert_with(IdentityKey::default)
            .identity_credential = credential;
        db.save().map_err(|e| Failure::device("save identity credential", e))?;
        tracing::info!("enrolled with CA");
        Ok(())
    }

    fn create_enroll_request(&self) -> Result<EnrollRequest> {
        let db = self.database.get();
        let encrypted_endorsement_credential = db
            .credentials
            .default_encrypted_endorsement_credential
            .clone()
            .ok_or_else(|| Error::Internal("no encrypted endorsement credential".into()))?;
        let binding = db
            .identity_binding
            .as_ref()
            .ok_or_else(|| Error::Internal("no identity key binding".into()))?;
        Ok(EnrollRequest {
            encrypted_endorsement_credential,
            identity_public_key: binding.identity_public_key_tpm_format.clone(),
            pcr0_quote: db.pcr0_quote.clone().unwrap_or_default(),
            pcr1_quote: db.pcr1_quote.clone().unwrap_or_default(),
        })
    }

    fn create_certificate_request(
        &mut self,
        username: &str,
        key: &CertifiedKey,
        profile: CertificateProfile,
        origin: &str,
    ) -> Result<CertificateRequest> {
        let identity_credential = self
            .database
            .get()
            .identity_key
            .as_ref()
            .map(|key| key.identity_credential.clone())
            .ok_or_else(|| Error::Internal("no identity key".into()))?;
        let message_id = self.crypto.get_random(NONCE_SIZE)?;

        let (origin, temporal_index) =
            if profile == CertificateProfile::ContentProtectionWithStableId {
                let index = temporal::choose_temporal_index(self.database.as_mut(), username, origin);
                (Some(origin.to_string()), Some(index))
            } else {
                (None, None)
            };

        Ok(CertificateRequest {
            message_id,
            identity_credential,
            profile,
            origin,
            temporal_index,
            certified_public_key: key.public_key_tpm_format.clone(),
            certified_key_info: key.certified_key_info.clone(),
            certified_key_proof: key.certified_key_proof.clone(),
        })
    }

    fn finish_certificate_request(
        &mut self,
        response: CertificateResponse,
        message_id: &[u8],
        username: &str,
        key_label: &str,
        mut key: CertifiedKey,
    ) -> std::result::Result<String, Failure> {
        if response.status != ResponseStatus::Ok {
            return Err(Failure::denied(response.detail));
        }
        if response.message_id != message_id {
            return Err(Failure::device("finish certificate request", "message ID mismatch"));
        }
        key.certified_key_credential = response.certified_key_credential;
        key.intermediate_ca_cert = response.intermediate_ca_cert;
        key.additional_intermediate_ca_cert = response.additional_intermediate_ca_cert;
        self.save_key(username, key_label, &key)
            .map_err(|e| Failure::device("save certified key", e))?;
        Ok(pem::certificate_chain(&key))
    }

    /// Create a key certified by the identity key and store it.
    fn create_key(
        &mut self,
        username: &str,
        key_label: &str,
        key_type: KeyType,
        key_usage: KeyUsage,
    ) -> Result<CertifiedKey> {
        let nonce = self.crypto.get_random(NONCE_SIZE)?;
        let identity_key_blob = self
            .database
            .get()
            .identity_key
            .as_ref()
            .map(|key| key.identity_key_blob.clone())
            .ok_or_else(|| Error::Internal("no identity key".into()))?;
        let material =
            self.tpm
                .create_certified_key(key_type, key_usage, &identity_key_blob, &nonce)?;
        let key = CertifiedKey {
            key_blob: material.key_blob,
            public_key: material.public_key,
            public_key_tpm_format: material.public_key_tpm_format,
            key_type,
            key_usage,
            certified_key_info: material.certify_info,
            certified_key_proof: material.proof,
            key_name: key_label.to_string(),
            ..Default::default()
        };
        self.save_key(username, key_label, &key)?;
        Ok(key)
    }

    fn save_key(&mut self, username: &str, key_label: &str, key: &CertifiedKey) -> Result<()> {
        if username.is_empty() {
            let mut db = self.database.edit();
            db.upsert_device_key(key.clone());
            db.save()?;
        } else {
            let bytes = types::encode(key)?;
            self.key_store.write(username, key_label, &bytes)?;
        }
        Ok(())
    }

    fn find_key(&self, username: &str, key_label: &str) -> Result<Option<CertifiedKey>> {
        if username.is_empty() {
            return Ok(self.database.get().find_device_key(key_label).cloned());
        }
        match self.key_store.read(username, key_label) {
            Ok(bytes) => Ok(Some(types::decode(&bytes)?)),
            Err(KeyStoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_key(&mut self, username: &str, key_label: &str) -> Result<()> {
        if username.is_empty() {
            let mut db = self.database.edit();
            if db.remove_device_key(key_label) {
                db.save()?;
            }
        } else {
            self.key_store.delete(username, key_label)?;
        }
        Ok(())
    }

    fn lookup(&self, username: &str, key_label: &str) -> std::result::Result<CertifiedKey, Failure> {
        match self.find_key(username, key_label) {
            Ok(Some(key)) => Ok(key),
            Ok(None) => {
                tracing::info!(key = key_label, "key not found");
                Err(Failure::status(Status::InvalidParameter))
            }
            Err(e) => Err(Failure::device("find key", e)),
        }
    }

    pub(crate) fn get_key_info(&mut self, request: &GetKeyInfoRequest) -> GetKeyInfoReply {
        let key = match self.lookup(&request.username, &request.key_label) {
            Ok(key) => key,
            Err(failure) => return failure.status.into(),
        };
        let public_key = match self.crypto.get_rsa_subject_public_key_info(&key.public_key) {
            Ok(public_key) => public_key,
            Err(e) => return Failure::device("convert public key", e).status.into(),
        };
        GetKeyInfoReply {
            status: Status::Success,
            key_type: key.key_type,
            key_usage: key.key_usage,
            public_key,
            certificate: pem::certificate_chain(&key),
            certify_info: key.certified_key_info,
            certify_info_signature: key.certified_key_proof,
        }
    }

    pub(crate) fn get_endorsement_info(
        &mut self,
        request: &GetEndorsementInfoRequest,
    ) -> GetEndorsementInfoReply {
        if let Err(failure) = Self::require_rsa(request.key_type) {
            return failure.status.into();
        }
        let mut ek_public_key = self.database.get().credentials.endorsement_public_key.clone();
        if ek_public_key.is_empty() {
            match self.tpm.get_endorsement_public_key() {
                Ok(public_key) => {
                    let mut db = self.database.edit();
                    db.credentials.endorsement_public_key = public_key.clone();
                    if let Err(e) = db.save() {
                        tracing::warn!(error = %e, "failed to cache endorsement public key");
                    }
                    ek_public_key = public_key;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "endorsement public key not available");
                    return Status::NotAvailable.into();
                }
            }
        }
        let ek_public_key = match self.crypto.get_rsa_subject_public_key_info(&ek_public_key) {
            Ok(public_key) => public_key,
            Err(e) => return Failure::device("convert endorsement key", e).status.into(),
        };
        let ek_certificate = Some(self.database.get().credentials.endorsement_credential.clone())
            .filter(|cert| !cert.is_empty());
        GetEndorsementInfoReply {
            status: Status::Success,
            ek_public_key,
            ek_certificate,
        }
    }

    pub(crate) fn get_attestation_key_info(
        &mut self,
        request: &GetAttestationKeyInfoRequest,
    ) -> GetAttestationKeyInfoReply {
        if let Err(failure) = Self::require_rsa(request.key_type) {
            return failure.status.into();
        }
        let db = self.database.get();
        let Some(identity_key) = db.identity_key.as_ref() else {
            return Status::NotAvailable.into();
        };

        let mut reply = GetAttestationKeyInfoReply::default();
        if !identity_key.identity_public_key.is_empty() {
            match self
                .crypto
                .get_rsa_subject_public_key_info(&identity_key.identity_public_key)
            {
                Ok(public_key) => reply.public_key = Some(public_key),
                Err(e) => return Failure::device("convert identity key", e).status.into(),
            }
        }
        reply.public_key_tpm_format = db
            .identity_binding
            .as_ref()
            .map(|binding| binding.identity_public_key_tpm_format.clone());
        reply.certificate = Some(identity_key.identity_credential.clone()).filter(|c| !c.is_empty());
        reply.pcr0_quote = db.pcr0_quote.clone();
        reply.pcr1_quote = db.pcr1_quote.clone();
        reply
    }

    pub(crate) fn activate_attestation_key(
        &mut self,
        request: &ActivateAttestationKeyRequest,
    ) -> ActivateAttestationKeyReply {
        if let Err(failure) = Self::require_rsa(request.key_type) {
            return failure.status.into();
        }
        let db = self.database.get();
        let Some(identity_key) = db.identity_key.as_ref() else {
            return Status::NotAvailable.into();
        };
        let certificate = match self.tpm.activate_identity(
            &db.delegate.blob,
            &db.delegate.secret,
            &identity_key.identity_key_blob,
            &request.encrypted_certificate.asym_ca_contents,
            &request.encrypted_certificate.sym_ca_attestation,
        ) {
            Ok(certificate) => certificate,
            Err(e) => return Failure::device("activate identity", e).status.into(),
        };

        if request.save_certificate {
            let mut db = self.database.edit();
            db.identity_key
                .get_or_insert_with(IdentityKey::default)
                .identity_credential = certificate.clone();
            if let Err(e) = db.save() {
                return Failure::device("save identity credential", e).status.into();
            }
        }
        ActivateAttestationKeyReply {
            status: Status::Success,
            certificate,
        }
    }

    pub(crate) fn create_certifiable_key(
        &mut self,
        request: &CreateCertifiableKeyRequest,
    ) -> CreateCertifiableKeyReply {
        if let Err(failure) = Self::require_rsa(request.key_type) {
            return failure.status.into();
        }
        let key = match self.create_key(
            &request.username,
            &request.key_label,
            request.key_type,
            request.key_usage,
        ) {
            Ok(key) => key,
            Err(e) => return Failure::device("create certified key", e).status.into(),
        };
        let public_key = match self.crypto.get_rsa_subject_public_key_info(&key.public_key) {
            Ok(public_key) => public_key,
            Err(e) => return Failure::device("convert public key", e).status.into(),
        };
        CreateCertifiableKeyReply {
            status: Status::Success,
            public_key,
            certify_info: key.certified_key_info,
            certify_info_signature: key.certified_key_proof,
        }
    }

    pub(crate) fn decrypt(&mut self, request: &DecryptRequest) -> DecryptReply {
        let key = match self.lookup(&request.username, &request.key_label) {
            Ok(key) => key,
            Err(failure) => return failure.status.into(),
        };
        match self.tpm.unbind(&key.key_blob, &request.encrypted_data) {
            Ok(data) => DecryptReply {
                status: Status::Success,
                decrypted_data: data.as_bytes().to_vec(),
            },
            Err(e) => Failure::device("unbind", e).status.into(),
        }
    }

    pub(crate) fn sign(&mut self, request: &SignRequest) -> SignReply {
        let key = match self.lookup(&request.username, &request.key_label) {
            Ok(key) => key,
            Err(failure) => return failure.status.into(),
        };
        match self.tpm.sign(&key.key_blob, &request.data_to_sign) {
            Ok(signature) => SignReply {
                status: Status::Success,
                signature,
            },
            Err(e) => Failure::device("sign", e).status.into(),
        }
    }

    pub(crate) fn register_key_with_chaps_token(
        &mut self,
        request: &RegisterKeyWithChapsTokenRequest,
    ) -> RegisterKeyWithChapsTokenReply {
        let key = match self.lookup(&request.username, &request.key_label) {
            Ok(key) => key,
            Err(failure) => return failure.status.into(),
        };
        match self.register_key(&request.username, &request.key_label, &key) {
            Ok(()) => Status::Success.into(),
            Err(e) => Failure::device("register key", e).status.into(),
        }
    }

    fn register_key(&mut self, username: &str, key_label: &str, key: &CertifiedKey) -> Result<()> {
        self.key_store.register(
            username,
            key_label,
            key.key_type,
            key.key_usage,
            &key.key_blob,
            &key.public_key,
            &key.certified_key_credential,
        )?;
        if !key.intermediate_ca_cert.is_empty() {
            self.key_store
                .register_certificate(username, &key.intermediate_ca_cert)?;
        }
        for certificate in &key.additional_intermediate_ca_cert {
            self.key_store.register_certificate(username, certificate)?;
        }
        self.delete_key(username, key_label)
    }
}
