use super::TpmError;
use super::keys;
use std::convert::TryFrom;
use tss_esapi::Context;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::handles::SessionHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::algorithm::PublicAlgorithm;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::interface_types::session_handles::PolicySession;
use tss_esapi::structures::Digest;
use tss_esapi::structures::KeyedHashScheme;
use tss_esapi::structures::PcrSelectionList;
use tss_esapi::structures::PcrSelectionListBuilder;
use tss_esapi::structures::PcrSlot;
use tss_esapi::structures::Private;
use tss_esapi::structures::Public;
use tss_esapi::structures::PublicBuilder;
use tss_esapi::structures::PublicKeyedHashParameters;
use tss_esapi::structures::SensitiveData;
use tss_esapi::structures::SymmetricDefinition;
use tss_esapi::traits::Marshall;
use tss_esapi::traits::UnMarshall;

fn pcr0_selection() -> Result<PcrSelectionList, TpmError> {
    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &[PcrSlot::Slot0])
        .build()
        .map_err(|e| TpmError::Seal(e.to_string()))
}

/// Start a session and extend it with PolicyPCR over the current PCR0.
fn start_pcr0_policy(ctx: &mut Context, session_type: SessionType) -> Result<PolicySession, TpmError> {
    let session = ctx
        .start_auth_session(
            None,
            None,
            None,
            session_type,
            SymmetricDefinition::Null,
            HashingAlgorithm::Sha256,
        )
        .map_err(|e| TpmError::Seal(e.to_string()))?
        .ok_or_else(|| TpmError::Seal("TPM returned no session".into()))?;
    let policy_session =
        PolicySession::try_from(session).map_err(|e| TpmError::Seal(e.to_string()))?;

    if let Err(e) = ctx.policy_pcr(policy_session, Digest::default(), pcr0_selection()?) {
        flush_session(ctx, policy_session);
        return Err(TpmError::Seal(e.to_string()));
    }
    Ok(policy_session)
}

fn flush_session(ctx: &mut Context, session: PolicySession) {
    let handle = SessionHandle::from(AuthSession::from(session));
    if let Err(e) = ctx.flush_context(handle.into()) {
        tracing::debug!(error = %e, "failed to flush policy session");
    }
}

/// Seal `data` under the storage root with a policy requiring PCR0 to hold
/// its current value. Returns a blob framed like every other key blob.
pub fn seal_to_pcr0(ctx: &mut Context, parent: KeyHandle, data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let trial = start_pcr0_policy(ctx, SessionType::Trial)?;
    let policy_digest = ctx.policy_get_digest(trial);
    flush_session(ctx, trial);
    let policy_digest = policy_digest.map_err(|e| TpmError::Seal(e.to_string()))?;

    let sensitive =
        SensitiveData::try_from(data.to_vec()).map_err(|e| TpmError::Seal(e.to_string()))?;

    // No user_with_auth: the policy is the only way to unseal.
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_no_da(true)
        .build()
        .map_err(|e| TpmError::Seal(e.to_string()))?;

    let pub_template = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_auth_policy(policy_digest)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Default::default())
        .build()
        .map_err(|e| TpmError::Seal(e.to_string()))?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create(parent, pub_template, None, Some(sensitive), None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Seal(e.to_string()))?;

    let public_bytes = result
        .out_public
        .marshall()
        .map_err(|e| TpmError::Seal(e.to_string()))?;
    Ok(keys::pack_blob(result.out_private.value(), &public_bytes))
}

/// Load a sealed object and unseal it. Fails if PCR0 has moved.
pub fn unseal(ctx: &mut Context, parent: KeyHandle, blob: &[u8]) -> Result<Vec<u8>, TpmError> {
    let (private_bytes, public_bytes) = keys::unpack_blob(blob)?;
    let private =
        Private::try_from(private_bytes.to_vec()).map_err(|e| TpmError::Seal(e.to_string()))?;
    let public = Public::unmarshall(public_bytes).map_err(|e| TpmError::Seal(e.to_string()))?;

    let sealed_handle = ctx
        .execute_with_nullauth_session(|ctx| ctx.load(parent, private, public))
        .map_err(|e: tss_esapi::Error| TpmError::Seal(e.to_string()))?;

    let policy_session = match start_pcr0_policy(ctx, SessionType::Policy) {
        Ok(session) => session,
        Err(e) => {
            let _ = ctx.flush_context(ObjectHandle::from(sealed_handle));
            return Err(e);
        }
    };

    let sensitive = ctx.execute_with_session(Some(policy_session.into()), |ctx| {
        ctx.unseal(ObjectHandle::from(sealed_handle))
    });
    flush_session(ctx, policy_session);
    let _ = ctx.flush_context(ObjectHandle::from(sealed_handle));

    let sensitive = sensitive.map_err(|e| TpmError::Seal(e.to_string()))?;
    Ok(sensitive.value().to_vec())
}
