//! The SDS gRPC service: state-of-the-world secret streams with ACK/NACK
//! tracking, on-demand fetching, and renewal at `expiry − jitter`.

use crate::{
    cache::SecretCache,
    client::SecretClient,
    SECRET_TYPE_URL,
};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use envoy_types::pb::google::protobuf::Any;
use parking_lot::Mutex;
use prost::Message;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// Renew this long before expiry, minus a random jitter so a fleet of
/// gateways does not stampede the backend at the same instant.
const RENEWAL_MARGIN_SECS: i64 = 60;
const RENEWAL_JITTER_SECS: i64 = 30;
const RENEWAL_RETRY_SECS: i64 = 30;

pub struct SdsServer<C> {
    cache: Arc<SecretCache>,
    client: Arc<C>,
    renewing: Arc<Mutex<HashSet<String>>>,
    drain: drain::Watch,
}

impl<C> Clone for SdsServer<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            client: self.client.clone(),
            renewing: self.renewing.clone(),
            drain: self.drain.clone(),
        }
    }
}

impl<C: SecretClient> SdsServer<C> {
    pub fn new(cache: Arc<SecretCache>, client: Arc<C>, drain: drain::Watch) -> Self {
        Self {
            cache,
            client,
            renewing: Arc::new(Mutex::new(HashSet::new())),
            drain,
        }
    }

    pub fn svc(self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self)
    }

    /// Runs the server until the drain handle fires, then finishes in-flight
    /// streams.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let drain = self.drain.clone();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::pin! {
            let srv = tonic::transport::Server::builder()
                .add_service(self.svc())
                .serve_with_shutdown(addr, async move {
                    let _ = close_rx.await;
                });
        }

        info!(%addr, "SDS server listening");
        tokio::select! {
            res = (&mut srv) => res?,
            handle = drain.signaled() => {
                let _ = close_tx.send(());
                handle.release_after(srv).await?;
            }
        }
        Ok(())
    }

    /// Fetches a secret into the cache if it is not already there, and
    /// schedules its renewal.
    async fn ensure_secret(&self, name: &str) -> Result<()> {
        if self.cache.contains(name) {
            return Ok(());
        }
        let certificate = self.client.fetch(name).await?;
        let expiry = certificate.expiry;
        self.cache.insert(name, certificate.to_secret(), expiry);
        self.schedule_renewal(name.to_string(), expiry);
        Ok(())
    }

    fn schedule_renewal(&self, name: String, expiry: Option<DateTime<Utc>>) {
        let Some(mut expiry) = expiry else {
            return;
        };
        if !self.renewing.lock().insert(name.clone()) {
            return;
        }

        let cache = self.cache.clone();
        let client = self.client.clone();
        let renewing = self.renewing.clone();
        tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..RENEWAL_JITTER_SECS);
                let renew_at = expiry - ChronoDuration::seconds(RENEWAL_MARGIN_SECS + jitter);
                let delay = (renew_at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;

                if !cache.contains(&name) {
                    renewing.lock().remove(&name);
                    return;
                }

                match client.fetch(&name).await {
                    Ok(certificate) => {
                        expiry = certificate
                            .expiry
                            .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(RENEWAL_RETRY_SECS));
                        let cert_expiry = certificate.expiry;
                        let version = cache.insert(&name, certificate.to_secret(), cert_expiry);
                        debug!(secret = %name, version, "renewed secret");
                    }
                    Err(error) => {
                        // Keep serving the previous version and retry soon.
                        warn!(secret = %name, %error, "secret renewal failed");
                        expiry = Utc::now()
                            + ChronoDuration::seconds(RENEWAL_MARGIN_SECS + RENEWAL_RETRY_SECS);
                    }
                }
            }
        });
    }
}

fn response_for(cache: &SecretCache, names: &HashSet<String>, nonce: u64) -> DiscoveryResponse {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    let resources = sorted
        .into_iter()
        .filter_map(|name| cache.get(name))
        .map(|cached| Any {
            type_url: SECRET_TYPE_URL.to_string(),
            value: cached.secret.encode_to_vec(),
        })
        .collect();

    DiscoveryResponse {
        version_info: cache.version().to_string(),
        resources,
        type_url: SECRET_TYPE_URL.to_string(),
        nonce: nonce.to_string(),
        ..Default::default()
    }
}

#[tonic::async_trait]
impl<C: SecretClient> SecretDiscoveryService for SdsServer<C> {
    type StreamSecretsStream = ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;
    type DeltaSecretsStream = ReceiverStream<std::result::Result<DeltaDiscoveryResponse, Status>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamSecretsStream>, Status> {
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let server = self.clone();

        tokio::spawn(async move {
            let mut updates = server.cache.subscribe();
            let mut subscribed: HashSet<String> = HashSet::new();
            let mut last: Option<(String, String)> = None;
            let mut nonce: u64 = 0;
            let shutdown = server.drain.clone().signaled();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    request = in_stream.next() => {
                        let request = match request {
                            Some(Ok(request)) => request,
                            Some(Err(error)) => {
                                warn!(%error, "error receiving SDS request");
                                break;
                            }
                            None => break,
                        };

                        if let Some(error) = &request.error_detail {
                            // The client rejected a previous version; keep
                            // serving what it has and wait for new state.
                            warn!(
                                code = error.code,
                                message = %error.message,
                                "SDS client NACKed configuration"
                            );
                            continue;
                        }

                        let current = server.cache.version().to_string();
                        let is_ack = last
                            .as_ref()
                            .map(|(version, last_nonce)| {
                                !request.response_nonce.is_empty()
                                    && request.response_nonce == *last_nonce
                                    && request.version_info == *version
                                    && *version == current
                            })
                            .unwrap_or(false);
                        if is_ack {
                            debug!(version = %current, "SDS client ACK");
                            continue;
                        }

                        subscribed = request.resource_names.iter().cloned().collect();
                        for name in &subscribed {
                            if let Err(error) = server.ensure_secret(name).await {
                                warn!(secret = %name, %error, "failed to fetch secret");
                            }
                        }

                        nonce += 1;
                        let response = response_for(&server.cache, &subscribed, nonce);
                        last = Some((response.version_info.clone(), response.nonce.clone()));
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    update = updates.recv() => {
                        match update {
                            Ok(name) if subscribed.contains(&name) => {}
                            Ok(_) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "SDS stream lagged behind cache updates");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                        if subscribed.is_empty() {
                            continue;
                        }
                        nonce += 1;
                        let response = response_for(&server.cache, &subscribed, nonce);
                        last = Some((response.version_info.clone(), response.nonce.clone()));
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut shutdown => break,
                }
            }
            debug!("SDS stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Status::unimplemented("delta SDS is not supported"))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();
        let names: HashSet<String> = request.resource_names.iter().cloned().collect();
        for name in &names {
            self.ensure_secret(name)
                .await
                .map_err(|error| Status::not_found(format!("secret {name}: {error}")))?;
        }
        Ok(Response::new(response_for(&self.cache, &names, 0)))
    }
}
