use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Identifies one version of the backing file. Two reads with equal stamps
/// are assumed to see the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub modified_nanos: u128,
    pub len: u64,
}

/// Storage for the encrypted database blob.
pub trait DatabaseIo: Send {
    fn read(&self) -> io::Result<Vec<u8>>;

    /// Replace the stored blob atomically.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Current stamp, or `None` if nothing is stored.
    fn stamp(&self) -> Option<Stamp>;
}

/// The database as a single owner-only file.
pub struct FileIo {
    path: PathBuf,
}

impl FileIo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatabaseIo for FileIo {
    fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        // `mode` only applies on creation; a stale temp file keeps its own.
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        File::open(&parent)?.sync_all()?;
        Ok(())
    }

    fn stamp(&self) -> Option<Stamp> {
        let meta = fs::metadata(&self.path).ok()?;
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Some(Stamp {
            modified_nanos,
            len: meta.len(),
        })
    }
}
