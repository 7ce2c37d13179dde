use super::CaError;
use std::time::Duration;
use tokio::runtime::Handle;

/// Blocking HTTP POST with a binary body. Runs on the service worker, which
/// is not a runtime thread.
pub trait HttpTransport: Send {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, CaError>;
}

/// [`HttpTransport`] backed by a shared async reqwest client, driven to
/// completion on the daemon's runtime.
pub struct ReqwestTransport {
    client: reqwest::Client,
    runtime: Handle,
}

impl ReqwestTransport {
    pub fn new(runtime: Handle, timeout: Duration) -> Result<Self, CaError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| CaError::Transport(e.to_string()))?;
        Ok(Self { client, runtime })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, CaError> {
        self.runtime.block_on(async {
            let response = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await
                .map_err(|e| CaError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(CaError::Http(status.as_u16()));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| CaError::Transport(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }
}
