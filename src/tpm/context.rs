use super::{TpmError, keys};
use std::sync::{Arc, Mutex};
use tss_esapi::handles::KeyHandle;
use tss_esapi::{Context, TctiNameConf};

struct TpmContextInner {
    ctx: Mutex<Context>,
    storage_root: KeyHandle,
}

/// Shared ESAPI context plus the storage root key every wrapped blob is
/// loaded under.
#[derive(Clone)]
pub struct TpmContext {
    inner: Arc<TpmContextInner>,
}

impl TpmContext {
    /// `device_path` is either a bare device node or a full TCTI string.
    pub fn new(device_path: &str) -> Result<Self, TpmError> {
        let tcti_str = if device_path.contains(':') {
            device_path.to_string()
        } else {
            format!("device:{device_path}")
        };
        let tcti = tcti_str
            .parse::<TctiNameConf>()
            .map_err(|e| TpmError::Context(e.to_string()))?;
        let mut ctx = Context::new(tcti).map_err(|e| TpmError::Context(e.to_string()))?;
        let storage_root = keys::create_storage_root(&mut ctx)?;
        tracing::debug!(tcti = %tcti_str, "TPM storage root key ready");
        Ok(Self {
            inner: Arc::new(TpmContextInner {
                ctx: Mutex::new(ctx),
                storage_root,
            }),
        })
    }

    /// Run a synchronous TPM command sequence. Commands never interleave.
    pub fn with_ctx<F, T>(&self, f: F) -> Result<T, TpmError>
    where
        F: FnOnce(&mut Context, KeyHandle) -> Result<T, TpmError>,
    {
        let mut ctx = self
            .inner
            .ctx
            .lock()
            .map_err(|_| TpmError::Context("mutex poisoned".into()))?;
        f(&mut ctx, self.inner.storage_root)
    }
}
