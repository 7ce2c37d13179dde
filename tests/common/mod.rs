//! In-memory stand-ins for the TPM, key store, database file and CA.
#![allow(dead_code)]

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use attestationd::ca::{
    CaError, CertificateRequest, CertificateResponse, EnrollRequest, EnrollResponse, HttpTransport,
    ResponseStatus,
};
use attestationd::config::{ENROLL_PATH, SIGN_PATH, ServiceConfig};
use attestationd::crypto::tpm_structs::{
    ASYM_CONTENT_HEADER, BOUND_DATA_HEADER, OAEP_LABEL, parse_sym_ca_attestation,
};
use attestationd::crypto::{CryptoUtility, CryptoUtilityImpl};
use attestationd::database::{DatabaseImpl, DatabaseIo, Stamp};
use attestationd::key_store::{KeyStore, KeyStoreError};
use attestationd::secret::SecretBytes;
use attestationd::tpm::{CertifiedKeyMaterial, IdentityKeyMaterial, TpmError, TpmUtility};
use attestationd::types::{self, EncryptedData, KeyType, KeyUsage, Quote};
use attestationd::{AttestationService, Components};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub const EK_CERTIFICATE: &[u8] = b"endorsement certificate";
pub const IDENTITY_CREDENTIAL: &[u8] = b"identity credential";
pub const LEAF_CERT: &[u8] = b"leaf certificate";
pub const INTERMEDIATE_CERT: &[u8] = b"intermediate certificate";
pub const ADDITIONAL_CERT: &[u8] = b"additional certificate";

pub fn generate_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate RSA key")
}

pub fn pkcs1_public(key: &RsaPublicKey) -> Vec<u8> {
    key.to_pkcs1_der().expect("encode public key").as_bytes().to_vec()
}

pub fn public_key_info(key: &RsaPublicKey) -> Vec<u8> {
    key.to_public_key_der()
        .expect("encode public key info")
        .as_bytes()
        .to_vec()
}

fn private_blob(key: &RsaPrivateKey) -> Vec<u8> {
    key.to_pkcs1_der()
        .expect("encode private key")
        .as_bytes()
        .to_vec()
}

fn load(blob: &[u8]) -> Result<RsaPrivateKey, TpmError> {
    RsaPrivateKey::from_pkcs1_der(blob).map_err(|e| TpmError::Blob(e.to_string()))
}

fn sign_sha256(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, TpmError> {
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data))
        .map_err(|e| TpmError::Key(e.to_string()))
}

/// Software TPM. Key blobs are plain PKCS#1 private keys and sealing is
/// a PCR0 prefix, which is enough to exercise every code path above the
/// TPM boundary.
pub struct FakeTpm {
    ready: AtomicBool,
    pcr0: Mutex<Vec<u8>>,
    ek: RsaPrivateKey,
    activations: AtomicUsize,
    unbind_label: &'static str,
    signing_paused: Mutex<bool>,
    signing_resumed: Condvar,
    signed: Mutex<Vec<Vec<u8>>>,
}

impl FakeTpm {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            pcr0: Mutex::new(vec![0u8; 32]),
            ek: generate_key(),
            activations: AtomicUsize::new(0),
            unbind_label: OAEP_LABEL,
            signing_paused: Mutex::new(false),
            signing_resumed: Condvar::new(),
            signed: Mutex::new(Vec::new()),
        }
    }

    /// Decrypt bound data under `label`, as a TPM of another generation would.
    pub fn with_unbind_label(mut self, label: &'static str) -> Self {
        self.unbind_label = label;
        self
    }

    /// Hold every `sign` call at the TPM until `resume_signing`.
    pub fn pause_signing(&self) {
        *self.signing_paused.lock().unwrap() = true;
    }

    pub fn resume_signing(&self) {
        *self.signing_paused.lock().unwrap() = false;
        self.signing_resumed.notify_all();
    }

    /// Data of every `sign` call that reached the TPM, in arrival order.
    pub fn signed(&self) -> Vec<Vec<u8>> {
        self.signed.lock().unwrap().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Simulate booting a different image.
    pub fn change_pcr0(&self) {
        let mut pcr0 = self.pcr0.lock().unwrap();
        let next = Sha256::digest(&*pcr0).to_vec();
        *pcr0 = next;
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn ek_public_key_info(&self) -> Vec<u8> {
        public_key_info(&self.ek.to_public_key())
    }
}

impl TpmUtility for FakeTpm {
    fn initialize(&self) -> Result<(), TpmError> {
        Ok(())
    }

    fn is_tpm_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn seal_to_pcr0(&self, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        let mut sealed = self.pcr0.lock().unwrap().clone();
        sealed.extend_from_slice(data);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<SecretBytes, TpmError> {
        let pcr0 = self.pcr0.lock().unwrap();
        match sealed.strip_prefix(pcr0.as_slice()) {
            Some(data) => Ok(SecretBytes::from_slice(data)),
            None => Err(TpmError::Seal("PCR0 mismatch".into())),
        }
    }

    fn create_certified_key(
        &self,
        key_type: KeyType,
        _key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKeyMaterial, TpmError> {
        if key_type != KeyType::Rsa {
            return Err(TpmError::Unsupported(key_type));
        }
        let identity = load(identity_key_blob)?;
        let key = generate_key();
        let public_key = pkcs1_public(&key.to_public_key());
        let mut certify_info = external_data.to_vec();
        certify_info.extend_from_slice(&Sha256::digest(&public_key));
        Ok(CertifiedKeyMaterial {
            key_blob: private_blob(&key),
            public_key_tpm_format: public_key.clone(),
            public_key,
            proof: sign_sha256(&identity, &certify_info)?,
            certify_info,
        })
    }

    fn activate_identity(
        &self,
        _delegate_blob: &[u8],
        _delegate_secret: &[u8],
        identity_key_blob: &[u8],
        asym_ca_contents: &[u8],
        sym_ca_attestation: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let identity = load(identity_key_blob)?;
        let contents = self
            .ek
            .decrypt(Oaep::new_with_label::<Sha1, _>(OAEP_LABEL), asym_ca_contents)
            .map_err(|e| TpmError::Identity(e.to_string()))?;
        if contents.len() != ASYM_CONTENT_HEADER.len() + 32 + 20
            || contents[..8] != ASYM_CONTENT_HEADER
        {
            return Err(TpmError::Identity("bad TPM_ASYM_CA_CONTENTS".into()));
        }
        let aik_digest = Sha1::digest(pkcs1_public(&identity.to_public_key()));
        if contents[40..] != aik_digest[..] {
            return Err(TpmError::Identity("credential bound to another key".into()));
        }
        let body = parse_sym_ca_attestation(sym_ca_attestation)
            .filter(|body| body.len() > 16)
            .ok_or_else(|| TpmError::Identity("bad TPM_SYM_CA_ATTESTATION".into()))?;
        let (iv, ciphertext) = body.split_at(16);
        cbc::Decryptor::<aes::Aes256>::new_from_slices(&contents[8..40], iv)
            .map_err(|e| TpmError::Identity(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TpmError::Identity("bad padding".into()))
    }

    fn sign(&self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.signed.lock().unwrap().push(data.to_vec());
        let mut paused = self.signing_paused.lock().unwrap();
        while *paused {
            paused = self.signing_resumed.wait(paused).unwrap();
        }
        drop(paused);
        sign_sha256(&load(key_blob)?, data)
    }

    fn unbind(&self, key_blob: &[u8], bound_data: &[u8]) -> Result<SecretBytes, TpmError> {
        let decrypted = load(key_blob)?
            .decrypt(Oaep::new_with_label::<Sha1, _>(self.unbind_label), bound_data)
            .map_err(|e| TpmError::Key(e.to_string()))?;
        decrypted
            .strip_prefix(&BOUND_DATA_HEADER[..])
            .map(SecretBytes::from_slice)
            .ok_or_else(|| TpmError::Blob("missing TPM_BOUND_DATA header".into()))
    }

    fn unbind_label(&self) -> &'static str {
        self.unbind_label
    }

    fn get_endorsement_public_key(&self) -> Result<Vec<u8>, TpmError> {
        Ok(pkcs1_public(&self.ek.to_public_key()))
    }

    fn get_endorsement_certificate(&self) -> Result<Vec<u8>, TpmError> {
        Ok(EK_CERTIFICATE.to_vec())
    }

    fn create_identity_key(&self) -> Result<IdentityKeyMaterial, TpmError> {
        let key = generate_key();
        let public_key = pkcs1_public(&key.to_public_key());
        Ok(IdentityKeyMaterial {
            key_blob: private_blob(&key),
            public_key_tpm_format: public_key.clone(),
            public_key,
        })
    }

    fn quote_pcr(
        &self,
        pcr_index: u8,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<Quote, TpmError> {
        let value = match pcr_index {
            0 => self.pcr0.lock().unwrap().clone(),
            n => vec![n; 32],
        };
        let mut quoted_data = external_data.to_vec();
        quoted_data.extend_from_slice(&value);
        Ok(Quote {
            quote: sign_sha256(&load(identity_key_blob)?, &quoted_data)?,
            quoted_data,
            quoted_pcr_value: value,
        })
    }
}

#[derive(Default)]
pub struct KeyStoreState {
    pub blobs: HashMap<(String, String), Vec<u8>>,
    /// (user, label, leaf certificate) per registered key.
    pub registered: Vec<(String, String, Vec<u8>)>,
    pub certificates: Vec<(String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct MemoryKeyStore(pub Arc<Mutex<KeyStoreState>>);

impl KeyStore for MemoryKeyStore {
    fn read(&self, username: &str, key_name: &str) -> Result<Vec<u8>, KeyStoreError> {
        self.0
            .lock()
            .unwrap()
            .blobs
            .get(&(username.to_string(), key_name.to_string()))
            .cloned()
            .ok_or(KeyStoreError::NotFound)
    }

    fn write(&mut self, username: &str, key_name: &str, key_data: &[u8]) -> Result<(), KeyStoreError> {
        self.0
            .lock()
            .unwrap()
            .blobs
            .insert((username.to_string(), key_name.to_string()), key_data.to_vec());
        Ok(())
    }

    fn delete(&mut self, username: &str, key_name: &str) -> Result<(), KeyStoreError> {
        self.0
            .lock()
            .unwrap()
            .blobs
            .remove(&(username.to_string(), key_name.to_string()));
        Ok(())
    }

    fn delete_by_prefix(&mut self, username: &str, key_prefix: &str) -> Result<(), KeyStoreError> {
        self.0
            .lock()
            .unwrap()
            .blobs
            .retain(|(user, name), _| user != username || !name.starts_with(key_prefix));
        Ok(())
    }

    fn register(
        &mut self,
        username: &str,
        label: &str,
        key_type: KeyType,
        _key_usage: KeyUsage,
        _private_key_blob: &[u8],
        _public_key_der: &[u8],
        certificate: &[u8],
    ) -> Result<(), KeyStoreError> {
        if key_type != KeyType::Rsa {
            return Err(KeyStoreError::Unsupported(key_type));
        }
        self.0.lock().unwrap().registered.push((
            username.to_string(),
            label.to_string(),
            certificate.to_vec(),
        ));
        Ok(())
    }

    fn register_certificate(&mut self, username: &str, certificate: &[u8]) -> Result<(), KeyStoreError> {
        let mut state = self.0.lock().unwrap();
        let entry = (username.to_string(), certificate.to_vec());
        if !state.certificates.contains(&entry) {
            state.certificates.push(entry);
        }
        Ok(())
    }
}

/// Database backing store in memory. Each write bumps the stamp.
#[derive(Clone, Default)]
pub struct MemoryIo(Arc<Mutex<(Option<Vec<u8>>, u128)>>);

impl MemoryIo {
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.0.lock().unwrap().0.clone()
    }
}

impl DatabaseIo for MemoryIo {
    fn read(&self) -> io::Result<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .0
            .clone()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.0.lock().unwrap();
        state.0 = Some(data.to_vec());
        state.1 += 1;
        Ok(())
    }

    fn stamp(&self) -> Option<Stamp> {
        let state = self.0.lock().unwrap();
        state.0.as_ref().map(|data| Stamp {
            modified_nanos: state.1,
            len: data.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaBehavior {
    Accept,
    Deny,
    /// Deny with an empty detail message.
    DenySilently,
    Unreachable,
    WrongMessageId,
}

struct CaState {
    enroll: CaBehavior,
    sign: CaBehavior,
    enroll_requests: Vec<EnrollRequest>,
    sign_requests: Vec<CertificateRequest>,
}

/// Scripted Attestation CA answering over [`HttpTransport`].
#[derive(Clone)]
pub struct FakeCa {
    state: Arc<Mutex<CaState>>,
    key: Arc<RsaPrivateKey>,
    ek_public_key_info: Vec<u8>,
    crypto: Arc<CryptoUtilityImpl>,
}

impl FakeCa {
    pub fn new(tpm: Arc<FakeTpm>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaState {
                enroll: CaBehavior::Accept,
                sign: CaBehavior::Accept,
                enroll_requests: Vec::new(),
                sign_requests: Vec::new(),
            })),
            key: Arc::new(generate_key()),
            ek_public_key_info: tpm.ek_public_key_info(),
            crypto: Arc::new(CryptoUtilityImpl::new(tpm)),
        }
    }

    pub fn public_key_info(&self) -> Vec<u8> {
        public_key_info(&self.key.to_public_key())
    }

    pub fn set_enroll(&self, behavior: CaBehavior) {
        self.state.lock().unwrap().enroll = behavior;
    }

    pub fn set_sign(&self, behavior: CaBehavior) {
        self.state.lock().unwrap().sign = behavior;
    }

    pub fn enroll_requests(&self) -> Vec<EnrollRequest> {
        self.state.lock().unwrap().enroll_requests.clone()
    }

    pub fn sign_requests(&self) -> Vec<CertificateRequest> {
        self.state.lock().unwrap().sign_requests.clone()
    }

    /// Open data a device encrypted for this CA.
    pub fn decrypt(&self, data: &EncryptedData) -> Vec<u8> {
        let aes_key = self
            .key
            .decrypt(Oaep::new::<Sha1>(), &data.wrapped_key)
            .expect("unwrap CA key");
        cbc::Decryptor::<aes::Aes256>::new_from_slices(&aes_key, &data.iv)
            .expect("cipher")
            .decrypt_padded_vec_mut::<Pkcs7>(&data.encrypted_data)
            .expect("decrypt")
    }

    fn enroll(&self, body: &[u8]) -> Result<Vec<u8>, CaError> {
        let request: EnrollRequest = types::decode(body)?;
        let mut state = self.state.lock().unwrap();
        state.enroll_requests.push(request.clone());
        let response = match state.enroll {
            CaBehavior::Unreachable => return Err(CaError::Transport("connection refused".into())),
            CaBehavior::Deny => EnrollResponse {
                status: ResponseStatus::ServerError,
                detail: "device not trusted".into(),
                ..Default::default()
            },
            CaBehavior::DenySilently => EnrollResponse {
                status: ResponseStatus::ServerError,
                ..Default::default()
            },
            CaBehavior::Accept | CaBehavior::WrongMessageId => EnrollResponse {
                encrypted_identity_credential: self
                    .crypto
                    .encrypt_identity_credential(
                        IDENTITY_CREDENTIAL,
                        &self.ek_public_key_info,
                        &request.identity_public_key,
                    )
                    .map_err(|e| CaError::Transport(e.to_string()))?,
                ..Default::default()
            },
        };
        Ok(types::encode(&response)?)
    }

    fn sign(&self, body: &[u8]) -> Result<Vec<u8>, CaError> {
        let request: CertificateRequest = types::decode(body)?;
        let mut state = self.state.lock().unwrap();
        state.sign_requests.push(request.clone());
        let message_id = match state.sign {
            CaBehavior::Unreachable => return Err(CaError::Http(503)),
            CaBehavior::Deny | CaBehavior::DenySilently => {
                let detail = match state.sign {
                    CaBehavior::Deny => "profile not allowed",
                    _ => "",
                };
                return Ok(types::encode(&CertificateResponse {
                    status: ResponseStatus::RejectedByPolicy,
                    detail: detail.into(),
                    message_id: request.message_id,
                    ..Default::default()
                })?);
            }
            CaBehavior::Accept => request.message_id,
            CaBehavior::WrongMessageId => request.message_id.iter().map(|b| !b).collect(),
        };
        Ok(types::encode(&CertificateResponse {
            status: ResponseStatus::Ok,
            detail: String::new(),
            message_id,
            certified_key_credential: LEAF_CERT.to_vec(),
            intermediate_ca_cert: INTERMEDIATE_CERT.to_vec(),
            additional_intermediate_ca_cert: vec![ADDITIONAL_CERT.to_vec()],
        })?)
    }
}

impl HttpTransport for FakeCa {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, CaError> {
        if url.ends_with(ENROLL_PATH) {
            self.enroll(&body)
        } else if url.ends_with(SIGN_PATH) {
            self.sign(&body)
        } else {
            Err(CaError::Http(404))
        }
    }
}

pub fn open_database(tpm: Arc<FakeTpm>, io: MemoryIo) -> DatabaseImpl {
    DatabaseImpl::new(Arc::new(CryptoUtilityImpl::new(tpm)), Box::new(io))
}

/// A running service wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub tpm: Arc<FakeTpm>,
    pub ca: FakeCa,
    pub key_store: MemoryKeyStore,
    pub io: MemoryIo,
    pub crypto: CryptoUtilityImpl,
    pub service: AttestationService,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(Arc::new(FakeTpm::new()))
    }

    pub fn start_with(tpm: Arc<FakeTpm>) -> Self {
        let ca = FakeCa::new(tpm.clone());
        let key_store = MemoryKeyStore::default();
        let io = MemoryIo::default();
        let service = AttestationService::start(
            Components {
                tpm: tpm.clone(),
                crypto: Arc::new(CryptoUtilityImpl::new(tpm.clone())),
                database: Box::new(open_database(tpm.clone(), io.clone())),
                key_store: Box::new(key_store.clone()),
                transport: Box::new(ca.clone()),
            },
            ServiceConfig {
                ca_origin: "https://ca.test".into(),
                ca_public_key: Some(ca.public_key_info()),
                ca_key_id: "test".into(),
            },
        )
        .expect("start service");
        Self {
            crypto: CryptoUtilityImpl::new(tpm.clone()),
            tpm,
            ca,
            key_store,
            io,
            service,
        }
    }
}

