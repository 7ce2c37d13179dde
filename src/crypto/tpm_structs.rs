//! Byte layouts of the TPM 1.2 structures exchanged with the ACA.

/// TPM_BOUND_DATA prefix: TPM_STRUCT_VER 1.1.0.0 then TPM_PT_BIND.
pub const BOUND_DATA_HEADER: [u8; 5] = [1, 1, 0, 0, 2];

/// OAEP encoding parameter a TPM 1.2 uses for every OAEP operation.
pub const OAEP_LABEL: &str = "TCPA";

/// The same label as a TPM 2.0 hashes it: RSA_Decrypt labels are
/// NUL-terminated.
pub const TPM2_OAEP_LABEL: &str = "TCPA\0";

/// TPM_SYMMETRIC_KEY header of TPM_ASYM_CA_CONTENTS: algId TPM_ALG_AES256
/// (u32), encScheme TPM_ES_SYM_CBC_PKCS5PAD (u16), key size (u16).
pub const ASYM_CONTENT_HEADER: [u8; 8] = [0, 0, 0, 9, 0, 2, 0, 32];

/// TPM_KEY_PARMS inside TPM_SYM_CA_ATTESTATION, left zeroed.
pub const SYM_KEY_PARMS_SIZE: usize = 12;

/// TPM_ASYM_CA_CONTENTS: session key header, the key, and the digest of the
/// identity key it is bound to.
pub fn asym_ca_contents(aes_key: &[u8], aik_digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ASYM_CONTENT_HEADER.len() + aes_key.len() + aik_digest.len());
    out.extend_from_slice(&ASYM_CONTENT_HEADER);
    out.extend_from_slice(aes_key);
    out.extend_from_slice(aik_digest);
    out
}

/// TPM_SYM_CA_ATTESTATION: credential size, key parameters, then the
/// IV-prefixed ciphertext.
pub fn sym_ca_attestation(encrypted_credential: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + SYM_KEY_PARMS_SIZE + encrypted_credential.len());
    out.extend_from_slice(&(encrypted_credential.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; SYM_KEY_PARMS_SIZE]);
    out.extend_from_slice(encrypted_credential);
    out
}

/// Split a TPM_SYM_CA_ATTESTATION back into its ciphertext.
pub fn parse_sym_ca_attestation(blob: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    blob.get(4 + SYM_KEY_PARMS_SIZE..)
        .filter(|body| body.len() == len)
}

/// True when `credential_blob` is a TPM_SYM_CA_ATTESTATION. A TPM 2.0
/// credential starts with the integrity HMAC's u16 size instead, which
/// never matches the u32 length this layout carries.
pub fn is_tpm12_credential(credential_blob: &[u8]) -> bool {
    parse_sym_ca_attestation(credential_blob).is_some()
}

pub fn bound_data(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BOUND_DATA_HEADER.len() + payload.len());
    out.extend_from_slice(&BOUND_DATA_HEADER);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asym_contents_layout() {
        let contents = asym_ca_contents(&[0xAA; 32], &[0xBB; 20]);
        assert_eq!(contents.len(), 60);
        assert_eq!(&contents[..8], &ASYM_CONTENT_HEADER);
        assert_eq!(&contents[8..40], &[0xAA; 32]);
        assert_eq!(&contents[40..], &[0xBB; 20]);
    }

    #[test]
    fn sym_attestation_is_length_prefixed() {
        let blob = sym_ca_attestation(b"ciphertext");
        assert_eq!(&blob[..4], &[0, 0, 0, 10]);
        assert_eq!(&blob[4..16], &[0u8; 12]);
        assert_eq!(parse_sym_ca_attestation(&blob), Some(&b"ciphertext"[..]));
    }

    #[test]
    fn sym_attestation_length_mismatch_is_rejected() {
        let mut blob = sym_ca_attestation(b"ciphertext");
        blob.push(0);
        assert_eq!(parse_sym_ca_attestation(&blob), None);
        assert_eq!(parse_sym_ca_attestation(&[0, 0]), None);
    }

    #[test]
    fn tpm12_credentials_are_recognized() {
        assert!(is_tpm12_credential(&sym_ca_attestation(&[0x11; 48])));

        // TPM2B_ID_OBJECT body: sized integrity HMAC, then encIdentity.
        let mut id_object = vec![0x00, 0x20];
        id_object.extend_from_slice(&[0x22; 32]);
        id_object.extend_from_slice(&[0x33; 34]);
        assert!(!is_tpm12_credential(&id_object));
        assert!(!is_tpm12_credential(&[]));
    }

    #[test]
    fn bound_data_prefix() {
        assert_eq!(bound_data(b"xy"), vec![1, 1, 0, 0, 2, b'x', b'y']);
    }
}
