use crate::{
    consul::{ConsulSyncAdapter, HttpConsul},
    exec::{self, ExecConfig},
    index::{self, ClusterConfig, Index, Reconciler, ServiceBackendResolver},
    k8s::{self, gateway},
    sds::{K8sSecretClient, MultiSecretClient, SdsServer, SecretCache, VaultKvClient, VaultPkiClient},
    state::{Store, StoreMetrics},
    status,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "consul-api-gateway", about = "Consul API gateway control plane")]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Runs the gateway controller.
    Server(ServerArgs),
    /// Supervises an Envoy instance inside a gateway pod.
    Exec(ExecArgs),
    /// Prints the version and exits.
    Version,
}

#[derive(Debug, clap::Args)]
struct ServerArgs {
    #[clap(
        long,
        default_value = "consul_gateway=info,warn",
        env = "CONSUL_GATEWAY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the SDS server listens on.
    #[clap(long, default_value = "0.0.0.0:9090")]
    sds_addr: SocketAddr,

    /// GatewayClass name this controller manages.
    #[clap(long, default_value = "consul-api-gateway")]
    gateway_class: String,

    /// Consul namespace configuration entries are written into.
    #[clap(long, default_value = "")]
    consul_namespace: String,

    #[clap(long, default_value = "127.0.0.1:8500", env = "CONSUL_HTTP_ADDR")]
    consul_address: String,

    #[clap(long, env = "CONSUL_HTTP_SSL")]
    consul_ssl: bool,

    #[clap(long, env = "CONSUL_HTTP_TOKEN")]
    consul_token: Option<String>,

    /// Seconds between full resyncs that heal out-of-band drift in Consul.
    #[clap(long, default_value = "60")]
    sync_period: u64,

    #[clap(long, env = "VAULT_ADDR")]
    vault_address: Option<String>,

    #[clap(long, env = "VAULT_TOKEN")]
    vault_token: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ExecArgs {
    #[clap(long, default_value = "info", env = "CONSUL_GATEWAY_LOG")]
    log_level: String,

    /// Name of the gateway being supervised.
    #[clap(long)]
    gateway_name: String,

    /// Consul namespace of the gateway service.
    #[clap(long)]
    consul_namespace: Option<String>,

    /// Address this pod serves traffic on.
    #[clap(long, env = "POD_IP")]
    address: String,

    /// Port the gateway listens on; also the TCP health-check target.
    #[clap(long)]
    port: u16,

    #[clap(long, default_value = "127.0.0.1:8500", env = "CONSUL_HTTP_ADDR")]
    consul_address: String,

    #[clap(long, env = "CONSUL_HTTP_SSL")]
    consul_ssl: bool,

    #[clap(long, env = "CONSUL_HTTP_TOKEN")]
    consul_token: Option<String>,

    /// ACL auth method for login; omit to skip authentication.
    #[clap(long)]
    acl_auth_method: Option<String>,

    /// File carrying the bearer token presented at ACL login.
    #[clap(long)]
    bearer_token_file: Option<PathBuf>,

    #[clap(long, default_value = "/certs")]
    cert_directory: PathBuf,

    #[clap(long, default_value = "envoy")]
    envoy_binary: PathBuf,

    #[clap(long, default_value = "/bootstrap/envoy.json")]
    bootstrap_path: PathBuf,

    #[clap(long, default_value = "19000")]
    admin_port: u16,

    #[clap(long, default_value = "127.0.0.1")]
    sds_address: String,

    #[clap(long, default_value = "9090")]
    sds_port: u16,

    #[clap(long, default_value = "127.0.0.1")]
    xds_address: String,

    #[clap(long, default_value = "8502")]
    xds_port: u16,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Server(args) => args.run().await,
            Command::Exec(args) => args.run().await,
            Command::Version => {
                println!("consul-api-gateway {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

impl ServerArgs {
    async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            sds_addr,
            gateway_class,
            consul_namespace,
            consul_address,
            consul_ssl,
            consul_token,
            sync_period,
            vault_address,
            vault_token,
        } = self;

        let mut prom = <Registry>::default();
        let store_metrics = StoreMetrics::register(prom.sub_registry_with_prefix("store"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let consul = Arc::new(HttpConsul::new(&consul_address, consul_ssl, consul_token));
        let adapter = Arc::new(ConsulSyncAdapter::new(consul));
        let store = Store::new(adapter, store_metrics);

        let config = Arc::new(ClusterConfig {
            gateway_class,
            consul_namespace: consul_namespace.clone(),
            ..ClusterConfig::default()
        });

        // The index records watch snapshots and forwards events; the
        // reconciler validates and drives the store.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let index = Index::shared(config.clone(), events_tx);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let resolver = Arc::new(ServiceBackendResolver::new(
            index.clone(),
            consul_namespace.clone(),
        ));
        let reconciler = Reconciler::new(
            config.clone(),
            index.clone(),
            store.clone(),
            resolver,
            status_tx.clone(),
            events_rx,
        );
        tokio::spawn(reconciler.run().instrument(info_span!("reconciler")));

        // Resource watches feed the shared index.
        let gateways = runtime.watch_all::<gateway::Gateway>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), gateways).instrument(info_span!("gateways")),
        );

        let http_routes = runtime.watch_all::<gateway::HttpRoute>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), http_routes)
                .instrument(info_span!("httproutes")),
        );

        let tcp_routes = runtime.watch_all::<gateway::TcpRoute>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), tcp_routes)
                .instrument(info_span!("tcproutes")),
        );

        let reference_grants =
            runtime.watch_all::<gateway::ReferenceGrant>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), reference_grants)
                .instrument(info_span!("referencegrants")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(
            watcher::Config::default().labels(&config.pod_gateway_label),
        );
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), secrets).instrument(info_span!("secrets")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            index::process_namespaces(index.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        let gateway_classes =
            runtime.watch_all::<gateway::GatewayClass>(watcher::Config::default());
        tokio::spawn(
            process_gateway_classes(status_tx, gateway_classes)
                .instrument(info_span!("gatewayclasses")),
        );

        // Status writeback, debounced by equality on the status block.
        let status_controller = status::Controller::new(runtime.client(), status_rx);
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Exactly one periodic resync loop per process.
        tokio::spawn(
            store
                .clone()
                .run_periodic_sync(Duration::from_secs(sync_period))
                .instrument(info_span!("periodic_sync")),
        );

        // The SDS server streams TLS material to the gateway proxies.
        let mut secret_client = MultiSecretClient::new().register(
            "k8s",
            Arc::new(K8sSecretClient::new(runtime.client())),
        );
        if let (Some(address), Some(token)) = (&vault_address, &vault_token) {
            secret_client = secret_client
                .register("vault-pki", Arc::new(VaultPkiClient::new(address, token)))
                .register("vault-kv", Arc::new(VaultKvClient::new(address, token)));
        }
        let sds = SdsServer::new(
            Arc::new(SecretCache::default()),
            Arc::new(secret_client),
            runtime.shutdown_handle(),
        );
        tokio::spawn(async move {
            if let Err(error) = sds.serve(sds_addr).await {
                tracing::error!(%error, "SDS server failed");
            }
        });

        info!("controller running");
        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

/// Marks GatewayClasses carrying our controller name as accepted.
async fn process_gateway_classes(
    statuses: mpsc::UnboundedSender<status::Update>,
    events: impl Stream<Item = watcher::Event<gateway::GatewayClass>>,
) {
    let mut send = move |class: gateway::GatewayClass| {
        if class.spec.controller_name != status::CONTROLLER_NAME {
            return;
        }
        let Some(name) = class.metadata.name.clone() else {
            return;
        };
        let update = status::Update::GatewayClass {
            name,
            generation: class.metadata.generation.unwrap_or_default(),
            accepted: true,
        };
        if statuses.send(update).is_err() {
            tracing::error!("status controller channel closed");
        }
    };

    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Applied(class) => send(class),
            watcher::Event::Restarted(classes) => classes.into_iter().for_each(&mut send),
            watcher::Event::Deleted(_) => {}
        }
    }
}

impl ExecArgs {
    async fn run(self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_new(&self.log_level)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();

        let bearer_token = match &self.bearer_token_file {
            Some(path) => tokio::fs::read_to_string(path).await?.trim().to_string(),
            None => String::new(),
        };

        let consul = Arc::new(HttpConsul::new(
            &self.consul_address,
            self.consul_ssl,
            self.consul_token.clone(),
        ));

        let config = ExecConfig {
            gateway_name: self.gateway_name,
            namespace: self.consul_namespace,
            address: self.address,
            port: self.port,
            auth_method: self.acl_auth_method,
            bearer_token,
            cert_directory: self.cert_directory,
            envoy_binary: self.envoy_binary,
            bootstrap_path: self.bootstrap_path,
            admin_port: self.admin_port,
            sds_address: self.sds_address,
            sds_port: self.sds_port,
            xds_address: self.xds_address,
            xds_port: self.xds_port,
            cert_wait_timeout: Duration::from_secs(60),
            cert_renew_interval: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(1),
            max_retries: 10,
        };

        let code = exec::run(config, consul, shutdown_signal()).await;
        if code != 0 {
            std::process::exit(code);
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
