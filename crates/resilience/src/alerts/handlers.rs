//! Built-in alert handlers

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{Alert, AlertError, AlertHandler};

/// Appends each alert as one JSON line.
#[derive(Debug)]
pub struct FileAlertHandler {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAlertHandler {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AlertError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertHandler for FileAlertHandler {
    fn handle(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(feature = "webhook")]
pub use webhook::WebhookAlertHandler;

#[cfg(feature = "webhook")]
mod webhook {
    use std::time::Duration;

    use once_cell::sync::OnceCell;
    use serde::Serialize;
    use tracing::{debug, warn};

    use super::{Alert, AlertError, AlertHandler};

    #[derive(Debug, Serialize)]
    struct WebhookPayload<'a> {
        /// Chat-style summary line
        text: String,
        alert: &'a Alert,
    }

    impl<'a> WebhookPayload<'a> {
        fn new(alert: &'a Alert) -> Self {
            Self { text: format!("[{}] {}", alert.level, alert.message), alert }
        }
    }

    /// POSTs each alert as JSON to a webhook URL.
    ///
    /// Inside a tokio runtime the request is spawned onto the runtime and
    /// `handle` returns immediately; delivery failures are then only logged.
    /// Outside a runtime the request is sent with a blocking client.
    #[derive(Debug)]
    pub struct WebhookAlertHandler {
        url: String,
        timeout: Duration,
        client: reqwest::Client,
        blocking: OnceCell<reqwest::blocking::Client>,
    }

    impl WebhookAlertHandler {
        pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
            Self::with_timeout(url, Duration::from_secs(10))
        }

        pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| AlertError::Delivery(format!("failed to build HTTP client: {err}")))?;
            Ok(Self { url: url.into(), timeout, client, blocking: OnceCell::new() })
        }

        pub fn url(&self) -> &str {
            &self.url
        }

        /// Deliver `alert` and wait for the response.
        pub async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
            post(&self.client, &self.url, alert).await
        }

        fn send_blocking(&self, alert: &Alert) -> Result<(), AlertError> {
            let client = self.blocking.get_or_try_init(|| {
                reqwest::blocking::Client::builder().timeout(self.timeout).build().map_err(|err| {
                    AlertError::Delivery(format!("failed to build HTTP client: {err}"))
                })
            })?;
            let response = client
                .post(&self.url)
                .json(&WebhookPayload::new(alert))
                .send()
                .map_err(|err| AlertError::Delivery(err.to_string()))?;
            check_status(response.status())
        }
    }

    async fn post(client: &reqwest::Client, url: &str, alert: &Alert) -> Result<(), AlertError> {
        let response = client
            .post(url)
            .json(&WebhookPayload::new(alert))
            .send()
            .await
            .map_err(|err| AlertError::Delivery(err.to_string()))?;
        check_status(response.status())
    }

    fn check_status(status: reqwest::StatusCode) -> Result<(), AlertError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(AlertError::Delivery(format!("webhook responded with {status}")))
        }
    }

    impl AlertHandler for WebhookAlertHandler {
        fn handle(&self, alert: &Alert) -> Result<(), AlertError> {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let client = self.client.clone();
                    let url = self.url.clone();
                    let alert = alert.clone();
                    runtime.spawn(async move {
                        match post(&client, &url, &alert).await {
                            Ok(()) => debug!(url = %url, "webhook alert delivered"),
                            Err(err) => warn!(url = %url, error = %err, "webhook alert failed"),
                        }
                    });
                    Ok(())
                }
                Err(_) => self.send_blocking(alert),
            }
        }

        fn name(&self) -> &str {
            "webhook"
        }
    }
}
