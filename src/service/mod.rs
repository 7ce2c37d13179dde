//! The attestation service: an async front end over a single worker thread
//! that owns the TPM, database, key store and CA client.

pub mod interface;
pub mod pem;
pub mod temporal;
mod worker;

pub use interface::*;

use crate::ca::{CaClient, HttpTransport};
use crate::config::ServiceConfig;
use crate::crypto::CryptoUtility;
use crate::database::Database;
use crate::error::Result;
use crate::key_store::KeyStore;
use crate::tpm::TpmUtility;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use worker::Worker;

/// Production or fake implementations the service is built from.
pub struct Components {
    pub tpm: Arc<dyn TpmUtility>,
    pub crypto: Arc<dyn CryptoUtility>,
    pub database: Box<dyn Database>,
    pub key_store: Box<dyn KeyStore>,
    pub transport: Box<dyn HttpTransport>,
}

type Task = Box<dyn FnOnce(&mut Worker) + Send>;

/// Handle to a running attestation worker.
///
/// Operations run one at a time in submission order. Dropping the handle
/// stops the worker after its current task; queued tasks never start.
pub struct AttestationService {
    tasks: Option<mpsc::UnboundedSender<Task>>,
    shutdown: Arc<AtomicBool>,
}

impl AttestationService {
    /// Spawn the worker. It initializes the TPM and database and prepares
    /// for enrollment before taking the first request.
    pub fn start(components: Components, config: ServiceConfig) -> Result<Self> {
        let (tasks, mut queue) = mpsc::unbounded_channel::<Task>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        std::thread::Builder::new()
            .name("attestation-worker".into())
            .spawn(move || {
                let ca = CaClient::new(components.transport, config.ca_origin.clone());
                let mut worker = Worker::new(
                    components.tpm,
                    components.crypto,
                    components.database,
                    components.key_store,
                    ca,
                    config,
                );
                worker.initialize();
                while let Some(task) = queue.blocking_recv() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    worker.database.reload_if_changed();
                    task(&mut worker);
                }
                tracing::debug!("attestation worker exiting");
            })?;

        Ok(Self {
            tasks: Some(tasks),
            shutdown,
        })
    }

    async fn post<R, F>(&self, operation: F) -> R
    where
        R: From<Status> + Send + 'static,
        F: FnOnce(&mut Worker) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task: Task = Box::new(move |worker| {
            // The caller may have gone away; its reply is dropped.
            let _ = reply_tx.send(operation(worker));
        });
        let Some(tasks) = self.tasks.as_ref() else {
            return Status::UnexpectedDeviceError.into();
        };
        if tasks.send(task).is_err() {
            tracing::error!("attestation worker is gone");
            return Status::UnexpectedDeviceError.into();
        }
        reply_rx.await.unwrap_or_else(|_| {
            tracing::error!("attestation worker dropped a request");
            Status::UnexpectedDeviceError.into()
        })
    }

    /// Enroll if needed, create a key and have the CA certify it.
    pub async fn create_google_attested_key(
        &self,
        request: CreateGoogleAttestedKeyRequest,
    ) -> CreateGoogleAttestedKeyReply {
        self.post(move |worker| worker.create_google_attested_key(&request))
            .await
    }

    pub async fn get_key_info(&self, request: GetKeyInfoRequest) -> GetKeyInfoReply {
        self.post(move |worker| worker.get_key_info(&request)).await
    }

    pub async fn get_endorsement_info(
        &self,
        request: GetEndorsementInfoRequest,
    ) -> GetEndorsementInfoReply {
        self.post(move |worker| worker.get_endorsement_info(&request))
            .await
    }

    pub async fn get_attestation_key_info(
        &self,
        request: GetAttestationKeyInfoRequest,
    ) -> GetAttestationKeyInfoReply {
        self.post(move |worker| worker.get_attestation_key_info(&request))
            .await
    }

    /// Out-of-band identity activation with caller-supplied blobs.
    pub async fn activate_attestation_key(
        &self,
        request: ActivateAttestationKeyRequest,
    ) -> ActivateAttestationKeyReply {
        self.post(move |worker| worker.activate_attestation_key(&request))
            .await
    }

    /// Create and store a certified key without contacting the CA.
    pub async fn create_certifiable_key(
        &self,
        request: CreateCertifiableKeyRequest,
    ) -> CreateCertifiableKeyReply {
        self.post(move |worker| worker.create_certifiable_key(&request))
            .await
    }

    pub async fn decrypt(&self, request: DecryptRequest) -> DecryptReply {
        self.post(move |worker| worker.decrypt(&request)).await
    }

    pub async fn sign(&self, request: SignRequest) -> SignReply {
        self.post(move |worker| worker.sign(&request)).await
    }

    /// Move a stored key into the user's PKCS#11 token.
    pub async fn register_key_with_chaps_token(
        &self,
        request: RegisterKeyWithChapsTokenRequest,
    ) -> RegisterKeyWithChapsTokenReply {
        self.post(move |worker| worker.register_key_with_chaps_token(&request))
            .await
    }
}

impl Drop for AttestationService {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.tasks.take();
    }
}
