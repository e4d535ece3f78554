//! Certificate-file lifecycle for the Envoy bootstrap.
//!
//! A single writer task renews leaf and root certificates and lands them in
//! the certificate directory with write-then-rename so Envoy never observes
//! a half-written file. The first successful write flips a watch channel the
//! bootstrapper blocks on.

use anyhow::{Context, Result};
use consul_gateway_controller_consul::LeafCerts;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const ROOT_CA_FILE: &str = "root-ca.pem";
pub const LEAF_CERT_FILE: &str = "leaf.crt";
pub const LEAF_KEY_FILE: &str = "leaf.key";

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct CertManager<C> {
    certs: Arc<C>,
    service: String,
    directory: PathBuf,
    renew_interval: Duration,
}

impl<C: LeafCerts> CertManager<C> {
    pub fn new(
        certs: Arc<C>,
        service: impl ToString,
        directory: impl Into<PathBuf>,
        renew_interval: Duration,
    ) -> Self {
        Self {
            certs,
            service: service.to_string(),
            directory: directory.into(),
            renew_interval,
        }
    }

    /// Starts the renewal task. The returned receiver flips to `true` once
    /// the first certificate pair has been written.
    pub fn spawn(self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                match self.write_certs().await {
                    Ok(()) => {
                        let _ = tx.send(true);
                        tokio::time::sleep(self.renew_interval).await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to write certificates");
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                }
            }
        });
        (rx, handle)
    }

    async fn write_certs(&self) -> Result<()> {
        let leaf = self
            .certs
            .leaf(&self.service)
            .await
            .context("fetching leaf certificate")?;
        let roots = self
            .certs
            .roots()
            .await
            .context("fetching root certificates")?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .context("creating certificate directory")?;
        write_atomic(&self.directory.join(ROOT_CA_FILE), roots.as_bytes()).await?;
        write_atomic(&self.directory.join(LEAF_CERT_FILE), leaf.cert_pem.as_bytes()).await?;
        write_atomic(&self.directory.join(LEAF_KEY_FILE), leaf.key_pem.as_bytes()).await?;
        tracing::debug!(directory = %self.directory.display(), "wrote certificates");
        Ok(())
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use consul_gateway_controller_consul::CertPair;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeCerts {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl LeafCerts for FakeCerts {
        async fn leaf(&self, service: &str) -> Result<CertPair> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("agent unavailable"));
            }
            Ok(CertPair {
                cert_pem: format!("CERT for {service}"),
                key_pem: "KEY".to_string(),
            })
        }

        async fn roots(&self) -> Result<String> {
            Ok("ROOTS".to_string())
        }
    }

    #[tokio::test]
    async fn first_write_signals_the_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let certs = Arc::new(FakeCerts {
            fail: AtomicBool::new(false),
        });
        let manager = CertManager::new(
            certs,
            "gw",
            dir.path().join("certs"),
            Duration::from_secs(3600),
        );
        let (mut written, handle) = manager.spawn();

        tokio::time::timeout(Duration::from_secs(5), written.wait_for(|ready| *ready))
            .await
            .expect("timed out waiting for certs")
            .expect("cert manager stopped");

        let cert = std::fs::read_to_string(dir.path().join("certs").join(LEAF_CERT_FILE)).unwrap();
        assert_eq!(cert, "CERT for gw");
        let roots = std::fs::read_to_string(dir.path().join("certs").join(ROOT_CA_FILE)).unwrap();
        assert_eq!(roots, "ROOTS");
        handle.abort();
    }

    #[tokio::test]
    async fn failures_do_not_signal() {
        let dir = tempfile::tempdir().unwrap();
        let certs = Arc::new(FakeCerts {
            fail: AtomicBool::new(true),
        });
        let manager = CertManager::new(
            certs,
            "gw",
            dir.path().join("certs"),
            Duration::from_secs(3600),
        );
        let (written, handle) = manager.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*written.borrow());
        handle.abort();
    }
}
