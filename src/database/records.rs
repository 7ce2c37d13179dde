use crate::types::{EncryptedData, KeyType, KeyUsage, Quote};
use serde::{Deserialize, Serialize};

/// A TPM key certified by the identity key, plus the certificate chain the
/// CA issued for it once that exchange has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertifiedKey {
    pub key_blob: Vec<u8>,
    /// DER PKCS#1 RSAPublicKey.
    pub public_key: Vec<u8>,
    pub public_key_tpm_format: Vec<u8>,
    pub key_type: KeyType,
    pub key_usage: KeyUsage,
    pub certified_key_info: Vec<u8>,
    pub certified_key_proof: Vec<u8>,
    /// Leaf certificate; empty until the CA has signed the key.
    pub certified_key_credential: Vec<u8>,
    pub intermediate_ca_cert: Vec<u8>,
    pub additional_intermediate_ca_cert: Vec<Vec<u8>>,
    pub key_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// DER PKCS#1 RSAPublicKey of the endorsement key.
    pub endorsement_public_key: Vec<u8>,
    pub endorsement_credential: Vec<u8>,
    /// The endorsement credential encrypted to the default ACA.
    pub default_encrypted_endorsement_credential: Option<EncryptedData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityKey {
    pub identity_key_blob: Vec<u8>,
    pub identity_public_key: Vec<u8>,
    /// Set once enrollment with the ACA has completed.
    pub identity_credential: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityBinding {
    pub identity_public_key_tpm_format: Vec<u8>,
    pub identity_public_key: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delegate {
    pub blob: Vec<u8>,
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalIndexRecord {
    /// SHA-256 of the origin.
    pub origin_hash: Vec<u8>,
    /// SHA-256 of the user.
    pub user_hash: Vec<u8>,
    pub temporal_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationDatabase {
    pub credentials: Credentials,
    pub identity_key: Option<IdentityKey>,
    pub identity_binding: Option<IdentityBinding>,
    pub delegate: Delegate,
    pub pcr0_quote: Option<Quote>,
    pub pcr1_quote: Option<Quote>,
    pub device_keys: Vec<CertifiedKey>,
    pub temporal_index_record: Vec<TemporalIndexRecord>,
}

impl AttestationDatabase {
    pub fn is_enrolled(&self) -> bool {
        self.identity_key
            .as_ref()
            .is_some_and(|key| !key.identity_credential.is_empty())
    }

    pub fn find_device_key(&self, name: &str) -> Option<&CertifiedKey> {
        self.device_keys.iter().find(|key| key.key_name == name)
    }

    /// Insert or replace the device key with the same name.
    pub fn upsert_device_key(&mut self, key: CertifiedKey) {
        match self
            .device_keys
            .iter_mut()
            .find(|existing| existing.key_name == key.key_name)
        {
            Some(existing) => *existing = key,
            None => self.device_keys.push(key),
        }
    }

    pub fn remove_device_key(&mut self, name: &str) -> bool {
        let before = self.device_keys.len();
        self.device_keys.retain(|key| key.key_name != name);
        self.device_keys.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, blob: &[u8]) -> CertifiedKey {
        CertifiedKey {
            key_name: name.into(),
            key_blob: blob.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_replaces_same_name() {
        let mut db = AttestationDatabase::default();
        db.upsert_device_key(key("a", b"1"));
        db.upsert_device_key(key("b", b"2"));
        db.upsert_device_key(key("a", b"3"));
        assert_eq!(db.device_keys.len(), 2);
        assert_eq!(db.find_device_key("a").unwrap().key_blob, b"3");
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut db = AttestationDatabase::default();
        db.upsert_device_key(key("a", b"1"));
        assert!(!db.remove_device_key("b"));
        assert!(db.remove_device_key("a"));
        assert!(db.device_keys.is_empty());
    }

    #[test]
    fn enrollment_requires_a_credential() {
        let mut db = AttestationDatabase::default();
        assert!(!db.is_enrolled());
        db.identity_key = Some(IdentityKey::default());
        assert!(!db.is_enrolled());
        db.identity_key.as_mut().unwrap().identity_credential = b"cert".to_vec();
        assert!(db.is_enrolled());
    }
}
