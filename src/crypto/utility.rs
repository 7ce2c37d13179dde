use super::tpm_structs;
use super::{CryptoError, CryptoUtility};
use crate::config::{AES_BLOCK_SIZE, AES_KEY_SIZE};
use crate::secret::SecretBytes;
use crate::tpm::TpmUtility;
use crate::types::{self, EncryptedData, EncryptedIdentityCredential};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// SHA-1 OAEP overhead: two digests plus two framing bytes.
const OAEP_SHA1_OVERHEAD: usize = 2 * 20 + 2;

pub struct CryptoUtilityImpl {
    tpm: Arc<dyn TpmUtility>,
}

impl CryptoUtilityImpl {
    pub fn new(tpm: Arc<dyn TpmUtility>) -> Self {
        Self { tpm }
    }
}

fn random_bytes(num_bytes: usize) -> Vec<u8> {
    let mut buf = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn aes_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256CbcEnc::new_from_slices(key, iv).map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn aes_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|e| CryptoError::Cipher(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Cipher("bad padding".into()))
}

fn hmac_sha512(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac =
        <HmacSha512 as Mac>::new_from_slice(key).map_err(|e| CryptoError::Cipher(e.to_string()))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// AES-256-CBC with a fresh IV plus HMAC-SHA512 over iv || ciphertext.
fn seal_symmetric(
    key: &[u8],
    data: &[u8],
    wrapped_key: Vec<u8>,
    wrapping_key_id: &str,
) -> Result<EncryptedData, CryptoError> {
    let iv = random_bytes(AES_BLOCK_SIZE);
    let encrypted_data = aes_encrypt(key, &iv, data)?;
    let mac = hmac_sha512(key, &iv, &encrypted_data)?;
    Ok(EncryptedData {
        wrapped_key,
        iv,
        mac,
        encrypted_data,
        wrapping_key_id: wrapping_key_id.to_string(),
    })
}

fn parse_public_key_info(public_key_info: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_der(public_key_info).map_err(|e| CryptoError::Rsa(e.to_string()))
}

fn tpm_oaep(label: &str) -> Oaep {
    Oaep::new_with_label::<Sha1, _>(label)
}

impl CryptoUtility for CryptoUtilityImpl {
    fn get_random(&self, num_bytes: usize) -> Result<Vec<u8>, CryptoError> {
        if num_bytes > i32::MAX as usize {
            return Err(CryptoError::Random(format!("{num_bytes} bytes requested")));
        }
        Ok(random_bytes(num_bytes))
    }

    fn create_sealed_key(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let aes_key = SecretBytes::new(random_bytes(AES_KEY_SIZE));
        let sealed_key = self.tpm.seal_to_pcr0(aes_key.as_bytes())?;
        Ok((aes_key, sealed_key))
    }

    fn encrypt_data(
        &self,
        data: &[u8],
        aes_key: &SecretBytes,
        sealed_key: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let record = seal_symmetric(aes_key.as_bytes(), data, sealed_key.to_vec(), "")?;
        Ok(types::encode(&record)?)
    }

    fn unseal_key(&self, encrypted: &[u8]) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let record: EncryptedData = types::decode(encrypted)?;
        let aes_key = self.tpm.unseal(&record.wrapped_key)?;
        if aes_key.len() != AES_KEY_SIZE {
            return Err(CryptoError::Format(format!(
                "unsealed key is {} bytes",
                aes_key.len()
            )));
        }
        Ok((aes_key, record.wrapped_key))
    }

    fn decrypt_data(
        &self,
        encrypted: &[u8],
        aes_key: &SecretBytes,
    ) -> Result<SecretBytes, CryptoError> {
        let record: EncryptedData = types::decode(encrypted)?;
        let expected = hmac_sha512(aes_key.as_bytes(), &record.iv, &record.encrypted_data)?;
        if expected.len() != record.mac.len() || !bool::from(expected.ct_eq(&record.mac)) {
            return Err(CryptoError::MacMismatch);
        }
        aes_decrypt(aes_key.as_bytes(), &record.iv, &record.encrypted_data).map(SecretBytes::new)
    }

    fn get_rsa_subject_public_key_info(&self, public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_der(public_key).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    fn get_rsa_public_key(&self, public_key_info: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = parse_public_key_info(public_key_info)?;
        let der = key
            .to_pkcs1_der()
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    fn encrypt_identity_credential(
        &self,
        credential: &[u8],
        ek_public_key_info: &[u8],
        aik_public_key_tpm_format: &[u8],
    ) -> Result<EncryptedIdentityCredential, CryptoError> {
        let ek = parse_public_key_info(ek_public_key_info)?;
        let aes_key = SecretBytes::new(random_bytes(AES_KEY_SIZE));

        let aik_digest = Sha1::digest(aik_public_key_tpm_format);
        let asym_content = SecretBytes::new(tpm_structs::asym_ca_contents(
            aes_key.as_bytes(),
            &aik_digest,
        ));
        let asym_ca_contents = ek
            .encrypt(
                &mut rand::thread_rng(),
                tpm_oaep(tpm_structs::OAEP_LABEL),
                asym_content.as_bytes(),
            )
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;

        let iv = random_bytes(AES_BLOCK_SIZE);
        let mut encrypted_credential = iv.clone();
        encrypted_credential.extend(aes_encrypt(aes_key.as_bytes(), &iv, credential)?);

        Ok(EncryptedIdentityCredential {
            asym_ca_contents,
            sym_ca_attestation: tpm_structs::sym_ca_attestation(&encrypted_credential),
        })
    }

    fn encrypt_for_unbind(&self, public_key_info: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = parse_public_key_info(public_key_info)?;
        let bound = tpm_structs::bound_data(data);
        let max = key.size().saturating_sub(OAEP_SHA1_OVERHEAD);
        if bound.len() > max {
            return Err(CryptoError::Format(format!(
                "{} bytes do not fit in one {}-byte OAEP block",
                data.len(),
                max
            )));
        }
        // Bound for the key's TPM, so under that TPM's label.
        key.encrypt(&mut rand::thread_rng(), tpm_oaep(self.tpm.unbind_label()), &bound)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }

    fn verify_signature(&self, public_key_info: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = parse_public_key_info(public_key_info) else {
            tracing::debug!("signature verification with malformed public key");
            return false;
        };
        let digest = Sha256::digest(data);
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }

    fn encrypt_data_for_ca(
        &self,
        data: &[u8],
        ca_public_key_info: &[u8],
        key_id: &str,
    ) -> Result<EncryptedData, CryptoError> {
        let ca_key = parse_public_key_info(ca_public_key_info)?;
        let aes_key = SecretBytes::new(random_bytes(AES_KEY_SIZE));
        let wrapped_key = ca_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), aes_key.as_bytes())
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        seal_symmetric(aes_key.as_bytes(), data, wrapped_key, key_id)
    }
}
