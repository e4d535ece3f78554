//! Envoy bootstrap rendering and process supervision.

use crate::certs::{LEAF_CERT_FILE, LEAF_KEY_FILE, ROOT_CA_FILE};
use crate::ExecConfig;
use anyhow::{Context, Result};
use rand::Rng;
use tokio::process::{Child, Command};

/// Renders the static bootstrap Envoy starts from: the admin interface, the
/// SDS cluster for certificate discovery, and the xDS cluster it receives
/// its routing configuration over, authenticated with the certificates the
/// cert manager wrote.
pub fn render_bootstrap(config: &ExecConfig) -> Result<String> {
    let certs = &config.cert_directory;
    let bootstrap = serde_json::json!({
        "node": {
            "id": config.envoy_node_id(),
            "cluster": config.gateway_name,
        },
        "admin": {
            "address": {
                "socket_address": { "address": "127.0.0.1", "port_value": config.admin_port }
            }
        },
        "static_resources": {
            "clusters": [
                {
                    "name": "sds-cluster",
                    "connect_timeout": "5s",
                    "type": "STRICT_DNS",
                    "typed_extension_protocol_options": {
                        "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                            "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                            "explicit_http_config": { "http2_protocol_options": {} }
                        }
                    },
                    "load_assignment": {
                        "cluster_name": "sds-cluster",
                        "endpoints": [{
                            "lb_endpoints": [{
                                "endpoint": {
                                    "address": {
                                        "socket_address": {
                                            "address": config.sds_address,
                                            "port_value": config.sds_port
                                        }
                                    }
                                }
                            }]
                        }]
                    }
                },
                {
                    "name": "consul-xds",
                    "connect_timeout": "5s",
                    "type": "STRICT_DNS",
                    "typed_extension_protocol_options": {
                        "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                            "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                            "explicit_http_config": { "http2_protocol_options": {} }
                        }
                    },
                    "transport_socket": {
                        "name": "tls",
                        "typed_config": {
                            "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
                            "common_tls_context": {
                                "tls_certificates": [{
                                    "certificate_chain": { "filename": certs.join(LEAF_CERT_FILE) },
                                    "private_key": { "filename": certs.join(LEAF_KEY_FILE) }
                                }],
                                "validation_context": {
                                    "trusted_ca": { "filename": certs.join(ROOT_CA_FILE) }
                                }
                            }
                        }
                    },
                    "load_assignment": {
                        "cluster_name": "consul-xds",
                        "endpoints": [{
                            "lb_endpoints": [{
                                "endpoint": {
                                    "address": {
                                        "socket_address": {
                                            "address": config.xds_address,
                                            "port_value": config.xds_port
                                        }
                                    }
                                }
                            }]
                        }]
                    }
                }
            ]
        },
        "dynamic_resources": {
            "ads_config": {
                "api_type": "DELTA_GRPC",
                "transport_api_version": "V3",
                "grpc_services": [{
                    "envoy_grpc": { "cluster_name": "consul-xds" }
                }]
            },
            "cds_config": { "ads": {}, "resource_api_version": "V3" },
            "lds_config": { "ads": {}, "resource_api_version": "V3" }
        }
    });
    serde_json::to_string_pretty(&bootstrap).context("rendering bootstrap configuration")
}

/// Writes the bootstrap file and spawns Envoy against it. Output streams are
/// inherited so the supervisor's stdout/stderr carry the proxy's.
pub async fn spawn(config: &ExecConfig) -> Result<Child> {
    let bootstrap = render_bootstrap(config)?;
    tokio::fs::write(&config.bootstrap_path, bootstrap)
        .await
        .with_context(|| format!("writing {}", config.bootstrap_path.display()))?;

    let mut command = Command::new(&config.envoy_binary);
    command
        .arg("-c")
        .arg(&config.bootstrap_path)
        .arg("--log-level")
        .arg("info")
        .arg("--base-id")
        .arg(rand::thread_rng().gen::<u32>().to_string())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .with_context(|| format!("spawning {}", config.envoy_binary.display()))?;
    if let Some(pid) = child.id() {
        tracing::info!(pid, "started envoy");
    }
    Ok(child)
}
