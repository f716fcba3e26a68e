use crate::errors::{DaemonError, Result};
use crate::remote::document_name;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(not(windows))]
const SPOOL_PATH: &str = "lp";
#[cfg(windows)]
const SPOOL_PATH: &str = "PrintTo";

/// Result of handing a document to the OS spooler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    pub message: String,
}

impl DispatchResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Submits documents to a named printer. Returns once the document has been
/// handed over (or the hand-over failed); it never waits for the page to
/// come out of the printer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrintDispatcher: Send + Sync {
    async fn submit(&self, printer_name: &str, document_ref: &str) -> DispatchResult;
}

/// Downloads the referenced document and spools it with the host's print
/// command (`lp` on Unix, `Start-Process -Verb PrintTo` on Windows).
pub struct SystemDispatcher {
    client: Client,
    #[cfg(windows)]
    shell: std::path::PathBuf,
    os_timeout: Duration,
}

impl SystemDispatcher {
    pub fn new(download_timeout: Duration, os_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(download_timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        Self {
            client,
            #[cfg(windows)]
            shell: crate::spooler::resolve_powershell(),
            os_timeout,
        }
    }

    /// Fetch the document into memory. HTTP failures keep the status code
    /// and body so callers can recognise expired links (403 AccessDenied).
    async fn download(&self, document_ref: &str) -> Result<Vec<u8>> {
        let response = self.client.get(document_ref).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(300).collect();
            return Err(DaemonError::Dispatch(format!("Fetch {}: {}", status, body.trim())));
        }
        let bytes = response.bytes().await?;
        debug!("Downloaded {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }

    #[cfg(not(windows))]
    async fn spool(&self, printer_name: &str, title: &str, data: &[u8]) -> Result<String> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("lp")
            .arg("-d")
            .arg(printer_name)
            .arg("-t")
            .arg(title)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Dispatch(format!("failed to start lp: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.os_timeout, child.wait_with_output())
            .await
            .map_err(|_| DaemonError::Dispatch("lp did not finish in time".to_string()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DaemonError::Dispatch(format!("lp failed: {}", stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    #[cfg(windows)]
    async fn spool(&self, printer_name: &str, title: &str, data: &[u8]) -> Result<String> {
        use crate::spooler::{escape_ps_string, run_powershell};

        let path = std::env::temp_dir().join(format!(
            "print-queue-relay-{}-{}",
            uuid::Uuid::new_v4(),
            title
        ));
        tokio::fs::write(&path, data).await?;

        let script = format!(
            r#"Start-Process -FilePath "{}" -Verb PrintTo -ArgumentList '"{}"' -WindowStyle Hidden -ErrorAction Stop"#,
            escape_ps_string(&path.to_string_lossy()),
            escape_ps_string(printer_name).replace('\'', "''"),
        );
        let result = run_powershell(&self.shell, &script, self.os_timeout)
            .await
            .map_err(|e| DaemonError::Dispatch(e.to_string()));

        // The viewer opens the file asynchronously; clean up later
        let cleanup = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            if let Err(e) = tokio::fs::remove_file(&cleanup).await {
                debug!("Temp document {:?} not removed: {}", cleanup, e);
            }
        });

        result
    }
}

#[async_trait]
impl PrintDispatcher for SystemDispatcher {
    #[tracing::instrument(skip(self, document_ref))]
    async fn submit(&self, printer_name: &str, document_ref: &str) -> DispatchResult {
        let title = document_name(document_ref).unwrap_or_else(|| "document.pdf".to_string());

        let data = match self.download(document_ref).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Document download failed: {}", e);
                return DispatchResult::failed(e.to_string());
            }
        };

        match self.spool(printer_name, &title, &data).await {
            Ok(detail) => {
                info!("Document {} sent to spooler on {}", title, printer_name);
                if detail.is_empty() {
                    DispatchResult::ok(format!("Print sent to spooler via {}", SPOOL_PATH))
                } else {
                    DispatchResult::ok(format!(
                        "Print sent to spooler via {} ({})",
                        SPOOL_PATH, detail
                    ))
                }
            }
            Err(e) => {
                warn!("Spooling {} on {} failed: {}", title, printer_name, e);
                DispatchResult::failed(e.to_string())
            }
        }
    }
}
