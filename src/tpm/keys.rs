use super::TpmError;
use crate::crypto::tpm_structs::TPM2_OAEP_LABEL;
use crate::types::KeyUsage;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{BigUint, RsaPublicKey};
use sha2::Digest as ShaDigest;
use sha2::Sha256;
use std::convert::TryFrom;
use std::convert::TryInto;
use tss_esapi::Context;
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::tss::TPM2_RH_NULL;
use tss_esapi::constants::tss::TPM2_ST_HASHCHECK;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::algorithm::PublicAlgorithm;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::Data;
use tss_esapi::structures::Digest;
use tss_esapi::structures::HashScheme;
use tss_esapi::structures::HashcheckTicket;
use tss_esapi::structures::Private;
use tss_esapi::structures::Public;
use tss_esapi::structures::PublicBuilder;
use tss_esapi::structures::PublicKeyRsa;
use tss_esapi::structures::PublicRsaParametersBuilder;
use tss_esapi::structures::RsaDecryptionScheme;
use tss_esapi::structures::RsaExponent;
use tss_esapi::structures::RsaScheme;
use tss_esapi::structures::Signature;
use tss_esapi::structures::SignatureScheme;
use tss_esapi::structures::SymmetricDefinitionObject;
use tss_esapi::traits::Marshall;
use tss_esapi::traits::UnMarshall;
use tss_esapi::tss2_esys::TPMT_TK_HASHCHECK;

/// RSA-2048 restricted decryption key in the owner hierarchy. Deterministic,
/// so every process that creates it gets the same parent for loaded blobs.
pub fn create_storage_root(ctx: &mut Context) -> Result<KeyHandle, TpmError> {
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    let pub_template = rsa_template(
        attrs,
        PublicRsaParametersBuilder::new()
            .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
            .with_scheme(RsaScheme::Null)
            .with_is_decryption_key(true)
            .with_restricted(true),
    )?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, pub_template, None, None, None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    Ok(result.key_handle)
}

/// Non-migratable RSA-2048 key with no authorization value, usable either
/// for RSASSA-PKCS1-v1_5 signing or for OAEP decryption.
pub fn create_rsa_key(
    ctx: &mut Context,
    parent: KeyHandle,
    usage: KeyUsage,
) -> Result<(Vec<u8>, Public), TpmError> {
    let base = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true);

    let (attrs, params) = match usage {
        KeyUsage::Sign => (
            base.with_sign_encrypt(true),
            PublicRsaParametersBuilder::new()
                .with_scheme(RsaScheme::RsaSsa(HashScheme::new(HashingAlgorithm::Sha256)))
                .with_is_signing_key(true),
        ),
        // Null scheme: the OAEP parameters are chosen per call in `unbind`.
        KeyUsage::Decrypt => (
            base.with_decrypt(true),
            PublicRsaParametersBuilder::new()
                .with_scheme(RsaScheme::Null)
                .with_is_decryption_key(true),
        ),
    };
    let attrs = attrs.build().map_err(|e| TpmError::Key(e.to_string()))?;
    let pub_template = rsa_template(attrs, params)?;
    create_child(ctx, parent, pub_template)
}

/// Restricted RSA signing key used as the attestation identity key.
pub fn create_restricted_signing_key(
    ctx: &mut Context,
    parent: KeyHandle,
) -> Result<(Vec<u8>, Public), TpmError> {
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_sign_encrypt(true)
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    let pub_template = rsa_template(
        attrs,
        PublicRsaParametersBuilder::new()
            .with_scheme(RsaScheme::RsaSsa(HashScheme::new(HashingAlgorithm::Sha256)))
            .with_is_signing_key(true)
            .with_restricted(true),
    )?;
    create_child(ctx, parent, pub_template)
}

fn rsa_template(
    attrs: ObjectAttributes,
    params: PublicRsaParametersBuilder,
) -> Result<Public, TpmError> {
    let rsa_params = params
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::ZERO_EXPONENT)
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))
}

fn create_child(
    ctx: &mut Context,
    parent: KeyHandle,
    pub_template: Public,
) -> Result<(Vec<u8>, Public), TpmError> {
    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create(parent, pub_template, None, None, None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    let public_bytes = result
        .out_public
        .marshall()
        .map_err(|e| TpmError::Key(e.to_string()))?;
    let blob = pack_blob(result.out_private.value(), &public_bytes);
    Ok((blob, result.out_public))
}

/// Frame a TPM2B_PRIVATE / TPM2B_PUBLIC pair as one opaque key blob:
/// `u32 BE private length || private || public`.
pub fn pack_blob(private_bytes: &[u8], public_bytes: &[u8]) -> Vec<u8> {
    let private_len = private_bytes.len() as u32;
    let mut blob = Vec::with_capacity(4 + private_bytes.len() + public_bytes.len());
    blob.extend_from_slice(&private_len.to_be_bytes());
    blob.extend_from_slice(private_bytes);
    blob.extend_from_slice(public_bytes);
    blob
}

pub fn unpack_blob(blob: &[u8]) -> Result<(&[u8], &[u8]), TpmError> {
    if blob.len() < 4 {
        return Err(TpmError::Blob("key blob is truncated".into()));
    }
    let (len_bytes, rest) = blob.split_at(4);
    let private_len = u32::from_be_bytes(
        len_bytes
            .try_into()
            .map_err(|_| TpmError::Blob("bad length prefix".into()))?,
    ) as usize;
    if rest.len() < private_len {
        return Err(TpmError::Blob("key blob private section truncated".into()));
    }
    Ok(rest.split_at(private_len))
}

pub fn load_key(ctx: &mut Context, parent: KeyHandle, blob: &[u8]) -> Result<KeyHandle, TpmError> {
    let (private_bytes, public_bytes) = unpack_blob(blob)?;
    let private =
        Private::try_from(private_bytes.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;
    let public = Public::unmarshall(public_bytes).map_err(|e| TpmError::Key(e.to_string()))?;

    ctx.execute_with_nullauth_session(|ctx| ctx.load(parent, private, public))
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))
}

/// Sign SHA-256(`data`) with the key's RSASSA-PKCS1-v1_5 scheme. The TPM
/// applies the SHA-256 DigestInfo prefix.
pub fn sign(ctx: &mut Context, key: KeyHandle, data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let hash_bytes: [u8; 32] = Sha256::digest(data).into();
    let digest = Digest::try_from(hash_bytes.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;

    let raw_ticket = TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    };
    let validation: HashcheckTicket = raw_ticket
        .try_into()
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    let signature = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.sign(key, digest, SignatureScheme::Null, validation)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    match signature {
        Signature::RsaSsa(rsa_sig) => Ok(rsa_sig.signature().value().to_vec()),
        _ => Err(TpmError::Key("Expected RSASSA signature".into())),
    }
}

/// RSAES-OAEP (SHA-1, NUL-terminated TPM label) decryption inside the TPM.
pub fn unbind(ctx: &mut Context, key: KeyHandle, ciphertext: &[u8]) -> Result<Vec<u8>, TpmError> {
    let cipher_text =
        PublicKeyRsa::try_from(ciphertext.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;
    let label = Data::try_from(TPM2_OAEP_LABEL.as_bytes().to_vec())
        .map_err(|e| TpmError::Key(e.to_string()))?;
    let scheme = RsaDecryptionScheme::Oaep(HashScheme::new(HashingAlgorithm::Sha1));

    let plain = ctx
        .execute_with_nullauth_session(|ctx| ctx.rsa_decrypt(key, cipher_text, scheme, label))
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;
    Ok(plain.value().to_vec())
}

/// Have `signer` certify `object`, binding `external_data` as qualifying data.
/// Returns the marshalled (TPMS_ATTEST, TPMT_SIGNATURE).
pub fn certify(
    ctx: &mut Context,
    object: KeyHandle,
    signer: KeyHandle,
    external_data: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), TpmError> {
    let qualifying_data =
        Data::try_from(external_data.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;

    let (attest, signature) = ctx
        .execute_with_sessions(
            (Some(AuthSession::Password), Some(AuthSession::Password), None),
            |ctx| ctx.certify(object.into(), signer, qualifying_data, SignatureScheme::Null),
        )
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    let certify_info = attest.marshall().map_err(|e| TpmError::Key(e.to_string()))?;
    let proof = signature.marshall().map_err(|e| TpmError::Key(e.to_string()))?;
    Ok((certify_info, proof))
}

pub fn flush(ctx: &mut Context, handle: KeyHandle) -> Result<(), TpmError> {
    ctx.flush_context(ObjectHandle::from(handle))
        .map_err(|e| TpmError::Key(e.to_string()))
}

/// DER-encoded PKCS#1 RSAPublicKey from a TPM public area.
pub fn rsa_public_key_der(public: &Public) -> Result<Vec<u8>, TpmError> {
    match public {
        Public::Rsa {
            parameters, unique, ..
        } => {
            // A zero exponent in the public area means the default, 65537.
            let exponent = match parameters.exponent().value() {
                0 => 65537,
                e => e,
            };
            let key = RsaPublicKey::new(BigUint::from_bytes_be(unique.value()), BigUint::from(exponent))
                .map_err(|e| TpmError::Key(e.to_string()))?;
            let der = key.to_pkcs1_der().map_err(|e| TpmError::Key(e.to_string()))?;
            Ok(der.as_bytes().to_vec())
        }
        _ => Err(TpmError::Key("Not an RSA key".into())),
    }
}
