use super::TpmError;
use super::keys;
use crate::types::Quote;
use std::convert::TryFrom;
use tss_esapi::Context;
use tss_esapi::abstraction::AsymmetricAlgorithmSelection;
use tss_esapi::abstraction::DefaultKey;
use tss_esapi::abstraction::ek;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::AuthHandle;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::handles::SessionHandle;
use tss_esapi::interface_types::algorithm::AsymmetricAlgorithm;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::interface_types::session_handles::PolicySession;
use tss_esapi::structures::Data;
use tss_esapi::structures::EncryptedSecret;
use tss_esapi::structures::IdObject;
use tss_esapi::structures::PcrSelectionListBuilder;
use tss_esapi::structures::PcrSlot;
use tss_esapi::structures::SignatureScheme;
use tss_esapi::structures::SymmetricDefinition;
use tss_esapi::traits::Marshall;

fn identity_err(e: impl std::fmt::Display) -> TpmError {
    TpmError::Identity(e.to_string())
}

/// Recreate the default RSA endorsement key from its template.
pub fn load_endorsement_key(ctx: &mut Context) -> Result<KeyHandle, TpmError> {
    ek::create_ek_object(ctx, AsymmetricAlgorithm::Rsa, DefaultKey).map_err(identity_err)
}

pub fn endorsement_public_key(ctx: &mut Context) -> Result<Vec<u8>, TpmError> {
    let ek_handle = load_endorsement_key(ctx)?;
    let public = ctx.read_public(ek_handle).map(|(public, _, _)| public);
    let _ = keys::flush(ctx, ek_handle);
    keys::rsa_public_key_der(&public.map_err(identity_err)?)
}

/// The manufacturer's EK certificate from NV storage.
pub fn endorsement_certificate(ctx: &mut Context) -> Result<Vec<u8>, TpmError> {
    ek::retrieve_ek_pubcert(ctx, AsymmetricAlgorithmSelection::Rsa(RsaKeyBits::Rsa2048))
        .map_err(identity_err)
}

/// Decrypt a credential the CA bound to the EK and to the name of the
/// identity key in `identity_key_blob`. The blobs are TPM 2.0
/// MakeCredential output.
pub fn activate_credential(
    ctx: &mut Context,
    storage_root: KeyHandle,
    identity_key_blob: &[u8],
    encrypted_secret: &[u8],
    credential_blob: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let credential = IdObject::try_from(credential_blob.to_vec()).map_err(identity_err)?;
    let secret = EncryptedSecret::try_from(encrypted_secret.to_vec()).map_err(identity_err)?;

    let ek_handle = load_endorsement_key(ctx)?;
    let ak_handle = match keys::load_key(ctx, storage_root, identity_key_blob) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = keys::flush(ctx, ek_handle);
            return Err(e);
        }
    };

    let result = endorsement_policy_session(ctx).and_then(|ek_auth| {
        let out = ctx
            .execute_with_sessions(
                (Some(AuthSession::Password), Some(ek_auth.into()), None),
                |ctx| ctx.activate_credential(ak_handle, ek_handle, credential, secret),
            )
            .map_err(identity_err);
        flush_session(ctx, ek_auth);
        out
    });

    let _ = keys::flush(ctx, ak_handle);
    let _ = keys::flush(ctx, ek_handle);
    Ok(result?.value().to_vec())
}

/// The default EK policy is PolicySecret(TPM_RH_ENDORSEMENT).
fn endorsement_policy_session(ctx: &mut Context) -> Result<PolicySession, TpmError> {
    let session = ctx
        .start_auth_session(
            None,
            None,
            None,
            SessionType::Policy,
            SymmetricDefinition::AES_128_CFB,
            HashingAlgorithm::Sha256,
        )
        .map_err(identity_err)?
        .ok_or_else(|| TpmError::Identity("TPM returned no session".into()))?;
    let policy_session = PolicySession::try_from(session).map_err(identity_err)?;

    let authorized = ctx.execute_with_nullauth_session(|ctx| {
        ctx.policy_secret(
            policy_session,
            AuthHandle::Endorsement,
            Default::default(),
            Default::default(),
            Default::default(),
            None,
        )
    });
    if let Err(e) = authorized {
        flush_session(ctx, policy_session);
        return Err(identity_err(e));
    }
    Ok(policy_session)
}

fn flush_session(ctx: &mut Context, session: PolicySession) {
    let handle = SessionHandle::from(AuthSession::from(session));
    if let Err(e) = ctx.flush_context(handle.into()) {
        tracing::debug!(error = %e, "failed to flush EK policy session");
    }
}

/// Quote a single PCR with the identity key and read back its value.
pub fn quote_pcr(
    ctx: &mut Context,
    storage_root: KeyHandle,
    pcr_index: u8,
    identity_key_blob: &[u8],
    external_data: &[u8],
) -> Result<Quote, TpmError> {
    if pcr_index >= 24 {
        return Err(TpmError::Identity(format!("PCR index {pcr_index} out of range")));
    }
    let slot = PcrSlot::try_from(1u32 << pcr_index).map_err(identity_err)?;
    let selection = PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &[slot])
        .build()
        .map_err(identity_err)?;
    let nonce = Data::try_from(external_data.to_vec()).map_err(identity_err)?;

    let ak_handle = keys::load_key(ctx, storage_root, identity_key_blob)?;
    let quoted = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.quote(ak_handle, nonce, SignatureScheme::Null, selection.clone())
        })
        .map_err(identity_err);
    let _ = ctx.flush_context(ObjectHandle::from(ak_handle));
    let (attest, signature) = quoted?;

    let (_, _, digests) = ctx.pcr_read(selection).map_err(identity_err)?;
    let quoted_pcr_value = digests
        .value()
        .first()
        .map(|d| d.value().to_vec())
        .ok_or_else(|| TpmError::Identity("PCR read returned no digest".into()))?;

    Ok(Quote {
        quote: signature.marshall().map_err(identity_err)?,
        quoted_data: attest.marshall().map_err(identity_err)?,
        quoted_pcr_value,
    })
}
