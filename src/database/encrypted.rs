use super::io::{DatabaseIo, Stamp};
use super::{AttestationDatabase, Database, DatabaseError};
use crate::config::LEGACY_CHECKSUM_SIZE;
use crate::crypto::CryptoUtility;
use crate::secret::SecretBytes;
use crate::types;
use std::sync::Arc;

struct SealedKey {
    aes_key: SecretBytes,
    sealed: Vec<u8>,
}

/// [`Database`] persisted as one [`crate::types::EncryptedData`] blob whose
/// AES key is sealed to PCR0.
pub struct DatabaseImpl {
    crypto: Arc<dyn CryptoUtility>,
    io: Box<dyn DatabaseIo>,
    contents: AttestationDatabase,
    key: Option<SealedKey>,
    stamp: Option<Stamp>,
}

impl DatabaseImpl {
    pub fn new(crypto: Arc<dyn CryptoUtility>, io: Box<dyn DatabaseIo>) -> Self {
        Self {
            crypto,
            io,
            contents: AttestationDatabase::default(),
            key: None,
            stamp: None,
        }
    }

    fn parse(plaintext: &[u8]) -> Result<AttestationDatabase, DatabaseError> {
        match types::decode::<AttestationDatabase>(plaintext) {
            Ok(contents) => Ok(contents),
            Err(e) if plaintext.len() > LEGACY_CHECKSUM_SIZE => {
                tracing::debug!(error = %e, "retrying database parse without legacy checksum");
                types::decode(&plaintext[..plaintext.len() - LEGACY_CHECKSUM_SIZE])
                    .map_err(|e| DatabaseError::Corrupt(e.to_string()))
            }
            Err(e) => Err(DatabaseError::Corrupt(e.to_string())),
        }
    }
}

impl Database for DatabaseImpl {
    fn initialize(&mut self) -> Result<(), DatabaseError> {
        if let Err(e) = self.reload() {
            tracing::warn!(error = %e, "database not loaded; starting empty");
            self.contents = AttestationDatabase::default();
            self.stamp = self.io.stamp();
        }
        Ok(())
    }

    fn get(&self) -> &AttestationDatabase {
        &self.contents
    }

    fn contents_mut(&mut self) -> &mut AttestationDatabase {
        &mut self.contents
    }

    fn save_changes(&mut self) -> Result<(), DatabaseError> {
        let plaintext = SecretBytes::new(
            types::encode(&self.contents).map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
        );
        let key = match self.key.take() {
            Some(key) => key,
            None => {
                let (aes_key, sealed) = self.crypto.create_sealed_key()?;
                SealedKey { aes_key, sealed }
            }
        };
        let encrypted = self
            .crypto
            .encrypt_data(plaintext.as_bytes(), &key.aes_key, &key.sealed);
        self.key = Some(key);

        self.io.write(&encrypted?)?;
        self.stamp = self.io.stamp();
        tracing::debug!("database saved");
        Ok(())
    }

    fn reload(&mut self) -> Result<(), DatabaseError> {
        let encrypted = self.io.read()?;
        let (aes_key, sealed) = self.crypto.unseal_key(&encrypted)?;
        let plaintext = self.crypto.decrypt_data(&encrypted, &aes_key)?;
        self.contents = Self::parse(plaintext.as_bytes())?;
        self.key = Some(SealedKey { aes_key, sealed });
        self.stamp = self.io.stamp();
        tracing::info!(
            device_keys = self.contents.device_keys.len(),
            enrolled = self.contents.is_enrolled(),
            "database loaded"
        );
        Ok(())
    }

    fn reload_if_changed(&mut self) {
        let current = self.io.stamp();
        if current.is_none() || current == self.stamp {
            return;
        }
        tracing::info!("database changed on disk; reloading");
        if let Err(e) = self.reload() {
            tracing::warn!(error = %e, "reload after external change failed");
            // Do not retry the same broken file on every task.
            self.stamp = current;
        }
    }
}
