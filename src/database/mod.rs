pub mod encrypted;
pub mod io;
pub mod records;

pub use encrypted::DatabaseImpl;
pub use io::{DatabaseIo, FileIo, Stamp};
pub use records::{
    AttestationDatabase, CertifiedKey, Credentials, Delegate, IdentityBinding, IdentityKey,
    TemporalIndexRecord,
};

use std::ops::{Deref, DerefMut};

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("Corrupt: {0}")]
    Corrupt(String),
}

/// Owner of the [`AttestationDatabase`] aggregate.
///
/// Only the service worker touches a `Database`. Mutation goes through
/// [`DatabaseMut`], obtained from `edit`, which must be saved explicitly.
pub trait Database: Send {
    /// Load from storage; an unreadable store starts empty.
    fn initialize(&mut self) -> Result<(), DatabaseError>;

    fn get(&self) -> &AttestationDatabase;

    /// Raw mutable access for [`DatabaseMut`]. Use `edit` instead.
    #[doc(hidden)]
    fn contents_mut(&mut self) -> &mut AttestationDatabase;

    fn save_changes(&mut self) -> Result<(), DatabaseError>;

    fn reload(&mut self) -> Result<(), DatabaseError>;

    /// Reload if the backing store changed since the last load or save.
    fn reload_if_changed(&mut self);
}

impl<'d> dyn Database + 'd {
    pub fn edit(&mut self) -> DatabaseMut<'_> {
        DatabaseMut {
            db: self,
            dirty: false,
            saved: false,
        }
    }
}

/// Scoped mutable borrow of the aggregate. Changes are visible to `get`
/// at once but only durable after [`DatabaseMut::save`].
pub struct DatabaseMut<'a> {
    db: &'a mut dyn Database,
    dirty: bool,
    saved: bool,
}

impl DatabaseMut<'_> {
    pub fn save(mut self) -> Result<(), DatabaseError> {
        self.saved = true;
        self.db.save_changes()
    }
}

impl Deref for DatabaseMut<'_> {
    type Target = AttestationDatabase;

    fn deref(&self) -> &AttestationDatabase {
        self.db.get()
    }
}

impl DerefMut for DatabaseMut<'_> {
    fn deref_mut(&mut self) -> &mut AttestationDatabase {
        self.dirty = true;
        self.db.contents_mut()
    }
}

impl Drop for DatabaseMut<'_> {
    fn drop(&mut self) {
        if self.dirty && !self.saved {
            tracing::warn!("database modified but not saved");
        }
    }
}
