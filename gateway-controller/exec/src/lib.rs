#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The per-gateway-pod supervisor.
//!
//! Boots one Envoy instance through sequential phases (ACL login, service
//! registration, certificate bootstrap, bootstrap rendering, exec) and
//! supervises it until the process is told to stop. Bootstrap failures are
//! fatal and exit non-zero; shutdown-path failures are reported and escalate
//! the exit code without interrupting the remaining cleanup.

mod certs;
mod envoy;

pub use certs::{CertManager, LEAF_CERT_FILE, LEAF_KEY_FILE, ROOT_CA_FILE};
pub use envoy::render_bootstrap;

use consul_gateway_controller_consul::{Acl, AclToken, AgentService, CatalogAgent, LeafCerts};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct ExecConfig {
    pub gateway_name: String,
    /// Consul namespace of the gateway service, when enterprise namespaces
    /// are in play.
    pub namespace: Option<String>,
    /// Address this pod serves on; also the target of the TCP check.
    pub address: String,
    pub port: u16,
    /// ACL auth method to log in against; `None` skips authentication.
    pub auth_method: Option<String>,
    /// Bearer token (e.g. the service account JWT) presented at login.
    pub bearer_token: String,
    pub cert_directory: PathBuf,
    pub envoy_binary: PathBuf,
    pub bootstrap_path: PathBuf,
    pub admin_port: u16,
    pub sds_address: String,
    pub sds_port: u16,
    pub xds_address: String,
    pub xds_port: u16,
    pub cert_wait_timeout: Duration,
    pub cert_renew_interval: Duration,
    pub retry_backoff: Duration,
    pub max_retries: u32,
}

impl ExecConfig {
    pub fn envoy_node_id(&self) -> String {
        format!("{}-{}", self.gateway_name, self.address)
    }

    fn service_id(&self) -> String {
        format!("{}-{}", self.gateway_name, self.address)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            gateway_name: "gw".to_string(),
            namespace: None,
            address: "127.0.0.1".to_string(),
            port: 8443,
            auth_method: None,
            bearer_token: String::new(),
            cert_directory: PathBuf::from("/tmp/certs"),
            envoy_binary: PathBuf::from("echo"),
            bootstrap_path: PathBuf::from("/tmp/bootstrap.json"),
            admin_port: 19000,
            sds_address: "127.0.0.1".to_string(),
            sds_port: 9090,
            xds_address: "127.0.0.1".to_string(),
            xds_port: 8502,
            cert_wait_timeout: Duration::from_secs(60),
            cert_renew_interval: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(10),
            max_retries: 3,
        }
    }
}

/// Runs the supervisor to completion, returning the process exit code.
/// `shutdown` is the external stop signal (SIGINT/SIGTERM or a parent
/// cancellation).
pub async fn run<C>(
    config: ExecConfig,
    consul: Arc<C>,
    shutdown: impl Future<Output = ()> + Send,
) -> i32
where
    C: Acl + CatalogAgent + LeafCerts,
{
    // Phase 1: authenticate. Constant backoff, bounded attempts.
    let token = match &config.auth_method {
        Some(auth_method) => {
            let mut meta = BTreeMap::new();
            meta.insert("component".to_string(), "consul-api-gateway".to_string());
            match retry(config.max_retries, config.retry_backoff, || {
                consul.login(auth_method, &config.bearer_token, &meta)
            })
            .await
            {
                Ok(token) => {
                    info!(accessor = %token.accessor_id, "logged into consul");
                    if token.is_global_management() {
                        warn!(
                            accessor = %token.accessor_id,
                            "login produced a global-management token; the gateway does not need admin access"
                        );
                    }
                    Some(token)
                }
                Err(error) => {
                    error!(%error, "error logging into consul");
                    return 1;
                }
            }
        }
        None => None,
    };

    // Phase 2: register this gateway instance with its TCP check.
    let service = AgentService {
        id: config.service_id(),
        name: config.gateway_name.clone(),
        namespace: config.namespace.clone(),
        address: config.address.clone(),
        port: config.port,
    };
    if let Err(error) = retry(config.max_retries, config.retry_backoff, || {
        consul.register(&service)
    })
    .await
    {
        error!(%error, "error registering service");
        logout(consul.as_ref(), &token).await;
        return 1;
    }

    // Phase 3: certificates on disk before Envoy starts.
    let manager = CertManager::new(
        consul.clone(),
        config.gateway_name.clone(),
        config.cert_directory.clone(),
        config.cert_renew_interval,
    );
    let (mut certs_written, cert_task) = manager.spawn();
    let wait = tokio::time::timeout(
        config.cert_wait_timeout,
        certs_written.wait_for(|written| *written),
    )
    .await;
    if !matches!(wait, Ok(Ok(_))) {
        error!("timeout waiting for certs to be written");
        cert_task.abort();
        cleanup(consul.as_ref(), &service, &token).await;
        return 1;
    }

    // Phases 4 and 5: render the bootstrap and exec Envoy.
    let mut child = match envoy::spawn(&config).await {
        Ok(child) => child,
        Err(error) => {
            error!(%error, "error starting envoy");
            cert_task.abort();
            cleanup(consul.as_ref(), &service, &token).await;
            return 1;
        }
    };

    // Phase 6: supervise until Envoy exits or we are told to stop.
    let mut exit_code = 0;
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => {
                    info!("envoy exited");
                }
                Ok(status) => {
                    error!(%status, "envoy exited abnormally");
                    exit_code = 1;
                }
                Err(error) => {
                    error!(%error, "error waiting for envoy");
                    exit_code = 1;
                }
            }
        }
        _ = shutdown => {
            if let Err(error) = child.kill().await {
                warn!(%error, "error stopping envoy");
            }
        }
    }

    info!("shutting down");
    cert_task.abort();
    if !cleanup(consul.as_ref(), &service, &token).await {
        exit_code = 1;
    }
    exit_code
}

/// Best-effort teardown: deregistration failures escalate the exit code but
/// never skip the token logout.
async fn cleanup<C>(consul: &C, service: &AgentService, token: &Option<AclToken>) -> bool
where
    C: Acl + CatalogAgent,
{
    let mut clean = true;
    if let Err(error) = consul.deregister(&service.id).await {
        error!(%error, "error deregistering service");
        clean = false;
    }
    if !logout(consul, token).await {
        clean = false;
    }
    clean
}

async fn logout<C: Acl>(consul: &C, token: &Option<AclToken>) -> bool {
    let Some(token) = token else {
        return true;
    };
    if let Err(error) = consul.logout(&token.secret_id).await {
        error!(%error, "error deleting acl token");
        return false;
    }
    true
}

async fn retry<T, E, Fut>(
    attempts: u32,
    backoff: Duration,
    mut operation: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut remaining = attempts.max(1);
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                remaining -= 1;
                if remaining == 0 {
                    return Err(error);
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
