use super::{
    CertifiedKeyMaterial, IdentityKeyMaterial, TpmContext, TpmError, TpmUtility, identity, keys,
    seal,
};
use crate::crypto::tpm_structs::{self, BOUND_DATA_HEADER, TPM2_OAEP_LABEL};
use crate::secret::SecretBytes;
use crate::types::{KeyType, KeyUsage, Quote};
use std::sync::OnceLock;
use tss_esapi::constants::PropertyTag;
use tss_esapi::traits::Marshall;

// TPMA_STARTUP_CLEAR bits.
const SH_ENABLE: u32 = 1 << 1;
const EH_ENABLE: u32 = 1 << 2;

/// [`TpmUtility`] backed by a TPM 2.0 device through tss-esapi.
pub struct TpmUtilityImpl {
    device_path: String,
    context: OnceLock<TpmContext>,
}

impl TpmUtilityImpl {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            context: OnceLock::new(),
        }
    }

    fn context(&self) -> Result<&TpmContext, TpmError> {
        self.context.get().ok_or(TpmError::NotInitialized)
    }

    fn require_rsa(key_type: KeyType) -> Result<(), TpmError> {
        match key_type {
            KeyType::Rsa => Ok(()),
            other => Err(TpmError::Unsupported(other)),
        }
    }
}

impl TpmUtility for TpmUtilityImpl {
    fn initialize(&self) -> Result<(), TpmError> {
        if self.context.get().is_some() {
            return Ok(());
        }
        let ctx = TpmContext::new(&self.device_path)?;
        // A racing initializer may have won; either context is usable.
        let _ = self.context.set(ctx);
        tracing::info!(device = %self.device_path, "TPM initialized");
        Ok(())
    }

    fn is_tpm_ready(&self) -> bool {
        let Ok(tpm) = self.context() else {
            return false;
        };
        let startup = tpm.with_ctx(|ctx, _| {
            ctx.get_tpm_property(PropertyTag::StartupClear)
                .map_err(|e| TpmError::Other(e.to_string()))
        });
        match startup {
            Ok(Some(flags)) => flags & SH_ENABLE != 0 && flags & EH_ENABLE != 0,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "TPM readiness query failed");
                false
            }
        }
    }

    fn seal_to_pcr0(&self, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.context()?
            .with_ctx(|ctx, srk| seal::seal_to_pcr0(ctx, srk, data))
    }

    fn unseal(&self, sealed: &[u8]) -> Result<SecretBytes, TpmError> {
        self.context()?
            .with_ctx(|ctx, srk| seal::unseal(ctx, srk, sealed))
            .map(SecretBytes::new)
    }

    fn create_certified_key(
        &self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKeyMaterial, TpmError> {
        Self::require_rsa(key_type)?;
        self.context()?.with_ctx(|ctx, srk| {
            let (key_blob, public) = keys::create_rsa_key(ctx, srk, key_usage)?;
            let public_key = keys::rsa_public_key_der(&public)?;
            let public_key_tpm_format = public.marshall().map_err(|e| TpmError::Key(e.to_string()))?;

            let key_handle = keys::load_key(ctx, srk, &key_blob)?;
            let signer = match keys::load_key(ctx, srk, identity_key_blob) {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = keys::flush(ctx, key_handle);
                    return Err(e);
                }
            };
            let certified = keys::certify(ctx, key_handle, signer, external_data);
            let _ = keys::flush(ctx, signer);
            let _ = keys::flush(ctx, key_handle);
            let (certify_info, proof) = certified?;

            Ok(CertifiedKeyMaterial {
                key_blob,
                public_key,
                public_key_tpm_format,
                certify_info,
                proof,
            })
        })
    }

    fn activate_identity(
        &self,
        delegate_blob: &[u8],
        delegate_secret: &[u8],
        identity_key_blob: &[u8],
        asym_ca_contents: &[u8],
        sym_ca_attestation: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        // Endorsement authorization comes from PolicySecret, not from an
        // owner delegation.
        if !delegate_blob.is_empty() || !delegate_secret.is_empty() {
            tracing::debug!("owner delegate not needed for credential activation");
        }
        // TPM2_ActivateCredential would misparse these as TPM2B structures.
        if tpm_structs::is_tpm12_credential(sym_ca_attestation) {
            tracing::warn!("refusing TPM 1.2 format identity credential");
            return Err(TpmError::LegacyCredential);
        }
        self.context()?.with_ctx(|ctx, srk| {
            identity::activate_credential(
                ctx,
                srk,
                identity_key_blob,
                asym_ca_contents,
                sym_ca_attestation,
            )
        })
    }

    fn sign(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.context()?.with_ctx(|ctx, srk| {
            let handle = keys::load_key(ctx, srk, key_blob)?;
            let signature = keys::sign(ctx, handle, data);
            let _ = keys::flush(ctx, handle);
            signature
        })
    }

    fn unbind(&self, key_blob: &[u8], bound_data: &[u8]) -> Result<SecretBytes, TpmError> {
        let decrypted = self.context()?.with_ctx(|ctx, srk| {
            let handle = keys::load_key(ctx, srk, key_blob)?;
            let plain = keys::unbind(ctx, handle, bound_data);
            let _ = keys::flush(ctx, handle);
            plain
        })?;
        let decrypted = SecretBytes::new(decrypted);
        match decrypted.as_bytes().strip_prefix(&BOUND_DATA_HEADER[..]) {
            Some(payload) => Ok(SecretBytes::from_slice(payload)),
            None => Err(TpmError::Blob("missing bound data header".into())),
        }
    }

    fn unbind_label(&self) -> &'static str {
        TPM2_OAEP_LABEL
    }

    fn get_endorsement_public_key(&self) -> Result<Vec<u8>, TpmError> {
        self.context()?
            .with_ctx(|ctx, _| identity::endorsement_public_key(ctx))
    }

    fn get_endorsement_certificate(&self) -> Result<Vec<u8>, TpmError> {
        self.context()?
            .with_ctx(|ctx, _| identity::endorsement_certificate(ctx))
    }

    fn create_identity_key(&self) -> Result<IdentityKeyMaterial, TpmError> {
        self.context()?.with_ctx(|ctx, srk| {
            let (key_blob, public) = keys::create_restricted_signing_key(ctx, srk)?;
            Ok(IdentityKeyMaterial {
                key_blob,
                public_key: keys::rsa_public_key_der(&public)?,
                public_key_tpm_format: public
                    .marshall()
                    .map_err(|e| TpmError::Key(e.to_string()))?,
            })
        })
    }

    fn quote_pcr(
        &self,
        pcr_index: u8,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<Quote, TpmError> {
        self.context()?.with_ctx(|ctx, srk| {
            identity::quote_pcr(ctx, srk, pcr_index, identity_key_blob, external_data)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_initialize_fail() {
        let tpm = TpmUtilityImpl::new("/dev/null-tpm");
        assert!(!tpm.is_tpm_ready());
        assert!(matches!(
            tpm.seal_to_pcr0(b"data"),
            Err(TpmError::NotInitialized)
        ));
        assert!(matches!(tpm.sign(b"blob", b"data"), Err(TpmError::NotInitialized)));
    }

    #[test]
    fn tpm12_credentials_are_refused_up_front() {
        let tpm = TpmUtilityImpl::new("/dev/null-tpm");
        let sym = tpm_structs::sym_ca_attestation(&[0x11; 48]);
        assert!(matches!(
            tpm.activate_identity(b"", b"", b"aik", &[0x5A; 256], &sym),
            Err(TpmError::LegacyCredential)
        ));
        assert_eq!(tpm.unbind_label(), "TCPA\0");
    }

    #[test]
    fn ecc_keys_are_unsupported() {
        let tpm = TpmUtilityImpl::new("/dev/null-tpm");
        assert!(matches!(
            tpm.create_certified_key(KeyType::Ecc, KeyUsage::Sign, b"", b""),
            Err(TpmError::Unsupported(KeyType::Ecc))
        ));
    }
}
