use super::{KeyStore, KeyStoreError};
use crate::types::{KeyType, KeyUsage};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::object::{
    Attribute, AttributeType, CertificateType, KeyType as Pkcs11KeyType, ObjectClass, ObjectHandle,
};
use cryptoki::session::Session;
use cryptoki::slot::Slot;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use sha1::{Digest, Sha1};
use std::path::Path;

/// CKA_APPLICATION tagging every data object this store owns.
pub const APPLICATION_ID: &[u8] = b"CrOS_d5bbc079d2497110feadfc97c40d718ae46f4658";

const CKA_VENDOR_DEFINED: u64 = 0x8000_0000;
/// TPM-wrapped private key blob on a private key object.
pub const KEY_BLOB_ATTRIBUTE: AttributeType = AttributeType::VendorDefined(CKA_VENDOR_DEFINED + 1);
/// Authorization data for the key blob; always empty here.
pub const AUTH_DATA_ATTRIBUTE: AttributeType = AttributeType::VendorDefined(CKA_VENDOR_DEFINED + 2);

/// Resolves which token slot holds a user's objects.
pub trait TokenManager: Send {
    fn slot_for_user(&self, pkcs11: &Pkcs11, username: &str) -> Result<Slot, KeyStoreError>;
}

/// Finds tokens by label: the empty user maps to the system token, any
/// other user to the token labelled with their name.
pub struct TokenLabelManager {
    system_token_label: String,
}

impl TokenLabelManager {
    pub fn new(system_token_label: impl Into<String>) -> Self {
        Self {
            system_token_label: system_token_label.into(),
        }
    }

    fn label_for<'a>(&'a self, username: &'a str) -> &'a str {
        if username.is_empty() {
            &self.system_token_label
        } else {
            username
        }
    }
}

impl TokenManager for TokenLabelManager {
    fn slot_for_user(&self, pkcs11: &Pkcs11, username: &str) -> Result<Slot, KeyStoreError> {
        let wanted = self.label_for(username);
        for slot in pkcs11.get_slots_with_token()? {
            let info = pkcs11.get_token_info(slot)?;
            if info.label().trim_end() == wanted {
                return Ok(slot);
            }
        }
        Err(KeyStoreError::NoToken(username.to_string()))
    }
}

/// PKCS#11 object ID shared by a key's public, private and certificate
/// objects.
pub fn object_id(modulus: &[u8]) -> Vec<u8> {
    Sha1::digest(modulus).to_vec()
}

/// [`KeyStore`] on top of per-user PKCS#11 tokens.
pub struct Pkcs11KeyStore {
    pkcs11: Pkcs11,
    tokens: Box<dyn TokenManager>,
}

impl Pkcs11KeyStore {
    pub fn open(module: impl AsRef<Path>, tokens: Box<dyn TokenManager>) -> Result<Self, KeyStoreError> {
        let pkcs11 = Pkcs11::new(module.as_ref())?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;
        tracing::info!(module = %module.as_ref().display(), "PKCS#11 module loaded");
        Ok(Self { pkcs11, tokens })
    }

    fn session(&self, username: &str) -> Result<Session, KeyStoreError> {
        let slot = self.tokens.slot_for_user(&self.pkcs11, username)?;
        Ok(self.pkcs11.open_rw_session(slot)?)
    }

    fn find_data_object(
        session: &Session,
        key_name: &str,
    ) -> Result<Option<ObjectHandle>, KeyStoreError> {
        let template = [
            Attribute::Class(ObjectClass::DATA),
            Attribute::Application(APPLICATION_ID.to_vec()),
            Attribute::Label(key_name.as_bytes().to_vec()),
        ];
        Ok(session.find_objects(&template)?.into_iter().next())
    }

    fn certificate_subject(certificate: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let (_, cert) = x509_parser::parse_x509_certificate(certificate)
            .map_err(|e| KeyStoreError::Certificate(e.to_string()))?;
        Ok(cert.tbs_certificate.subject.as_raw().to_vec())
    }

    fn create_certificate(
        session: &Session,
        certificate: &[u8],
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<(), KeyStoreError> {
        let mut template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Modifiable(false),
            Attribute::Subject(Self::certificate_subject(certificate)?),
            Attribute::Value(certificate.to_vec()),
        ];
        if let Some(id) = id {
            template.push(Attribute::Id(id.to_vec()));
        }
        if let Some(label) = label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        session.create_object(&template)?;
        Ok(())
    }
}

impl KeyStore for Pkcs11KeyStore {
    fn read(&self, username: &str, key_name: &str) -> Result<Vec<u8>, KeyStoreError> {
        let session = self.session(username)?;
        let handle = Self::find_data_object(&session, key_name)?.ok_or(KeyStoreError::NotFound)?;
        let attributes = session.get_attributes(handle, &[AttributeType::Value])?;
        attributes
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::Value(value) => Some(value),
                _ => None,
            })
            .ok_or_else(|| KeyStoreError::Token("data object has no value".into()))
    }

    fn write(&mut self, username: &str, key_name: &str, key_data: &[u8]) -> Result<(), KeyStoreError> {
        let session = self.session(username)?;
        // Data objects are not modifiable, so an update is delete + create.
        if let Some(existing) = Self::find_data_object(&session, key_name)? {
            session.destroy_object(existing)?;
        }
        let template = [
            Attribute::Class(ObjectClass::DATA),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Modifiable(false),
            Attribute::Application(APPLICATION_ID.to_vec()),
            Attribute::Label(key_name.as_bytes().to_vec()),
            Attribute::Value(key_data.to_vec()),
        ];
        session.create_object(&template)?;
        tracing::debug!(key = key_name, "key written to token");
        Ok(())
    }

    fn delete(&mut self, username: &str, key_name: &str) -> Result<(), KeyStoreError> {
        let session = self.session(username)?;
        if let Some(handle) = Self::find_data_object(&session, key_name)? {
            session.destroy_object(handle)?;
        }
        Ok(())
    }

    fn delete_by_prefix(&mut self, username: &str, key_prefix: &str) -> Result<(), KeyStoreError> {
        let session = self.session(username)?;
        let template = [
            Attribute::Class(ObjectClass::DATA),
            Attribute::Application(APPLICATION_ID.to_vec()),
        ];
        let mut deleted = 0usize;
        for handle in session.find_objects(&template)? {
            let labels = session.get_attributes(handle, &[AttributeType::Label])?;
            if label_has_prefix(&labels, key_prefix) {
                session.destroy_object(handle)?;
                deleted += 1;
            }
        }
        tracing::debug!(prefix = key_prefix, deleted, "keys deleted by prefix");
        Ok(())
    }

    fn register(
        &mut self,
        username: &str,
        label: &str,
        key_type: KeyType,
        key_usage: KeyUsage,
        private_key_blob: &[u8],
        public_key_der: &[u8],
        certificate: &[u8],
    ) -> Result<(), KeyStoreError> {
        if key_type != KeyType::Rsa {
            return Err(KeyStoreError::Unsupported(key_type));
        }
        let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
            .map_err(|e| KeyStoreError::Token(format!("bad public key: {e}")))?;
        let modulus = public_key.n().to_bytes_be();
        let exponent = public_key.e().to_bytes_be();
        let id = object_id(&modulus);
        let is_sign = key_usage == KeyUsage::Sign;
        let is_decrypt = key_usage == KeyUsage::Decrypt;

        let session = self.session(username)?;

        let public_template = [
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(Pkcs11KeyType::RSA),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Modifiable(false),
            Attribute::Id(id.clone()),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Verify(is_sign),
            Attribute::Encrypt(is_decrypt),
            Attribute::Wrap(false),
            Attribute::Modulus(modulus.clone()),
            Attribute::PublicExponent(exponent.clone()),
        ];
        session.create_object(&public_template)?;

        let private_template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(Pkcs11KeyType::RSA),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Modifiable(false),
            Attribute::Id(id.clone()),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Sign(is_sign),
            Attribute::Decrypt(is_decrypt),
            Attribute::Unwrap(false),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Modulus(modulus),
            Attribute::PublicExponent(exponent),
            Attribute::VendorDefined((KEY_BLOB_ATTRIBUTE, private_key_blob.to_vec())),
            Attribute::VendorDefined((AUTH_DATA_ATTRIBUTE, Vec::new())),
        ];
        session.create_object(&private_template)?;

        if !certificate.is_empty() {
            Self::create_certificate(&session, certificate, Some(&id), Some(label))?;
        }
        tracing::info!(label, "key registered with token");
        Ok(())
    }

    fn register_certificate(&mut self, username: &str, certificate: &[u8]) -> Result<(), KeyStoreError> {
        let session = self.session(username)?;
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Value(certificate.to_vec()),
        ];
        if !session.find_objects(&template)?.is_empty() {
            tracing::debug!("certificate already registered");
            return Ok(());
        }
        Self::create_certificate(&session, certificate, None, None)
    }
}

fn label_has_prefix(attributes: &[Attribute], prefix: &str) -> bool {
    attributes.iter().any(|attribute| match attribute {
        Attribute::Label(label) => label.starts_with(prefix.as_bytes()),
        _ => false,
    })
}
