//! kops-controller - issues node certificates and serves host records
//!
//! One TLS listener carries both the JSON `POST /bootstrap` endpoint and the
//! `KopsControllerService` gRPC service; axum routes gRPC requests by path.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, ValueEnum};
use kops_bootstrap::discovery::DEFAULT_POLL_INTERVAL;
use kops_bootstrap::server::signer_keypair_ids;
use kops_bootstrap::verify::{
    DigitalOceanVerifier, HetznerVerifier, KubeHostKeyStore, PkiVerifier, DEFAULT_MAX_TIME_SKEW,
};
use kops_bootstrap::{
    bootstrap_router, BootstrapState, ConfigMapHostsSource, DiscoveryService,
    FileNodeConfigSource, GrpcChallenger, ServerOptions, Verifier, VerifierChain,
};
use kops_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kops_common::KOPS_CONTROLLER_PORT;
use kops_pki::{CertProfile, Keystore, CLUSTER_CA};
use kops_proto::KopsControllerServiceServer;
use tracing::{info, warn};

/// Certificate names enabled when none are configured
const DEFAULT_CERT_NAMES: &[&str] = &["kubelet", "kubelet-server", "kube-proxy"];

/// Ways a node may prove its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VerifierKind {
    /// Enrolled machine keys stored as Host resources
    Pki,
    /// Hetzner Cloud server IDs
    Hetzner,
    /// DigitalOcean droplet IDs
    Digitalocean,
}

/// kops-controller bootstrap server
#[derive(Parser, Debug)]
#[command(name = "kops-controller", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "KOPS_CONTROLLER_LISTEN", default_value_t = default_listen())]
    listen: SocketAddr,

    /// Name of the cluster this controller serves
    #[arg(long, env = "KOPS_CLUSTER_NAME")]
    cluster_name: String,

    /// PEM certificate presented to nodes
    #[arg(long, env = "KOPS_CONTROLLER_TLS_CERT")]
    server_cert: PathBuf,

    /// PEM private key of the serving certificate
    #[arg(long, env = "KOPS_CONTROLLER_TLS_KEY")]
    server_key: PathBuf,

    /// Directory holding `<ca>.crt`, `<ca>.key` and `keypair-ids.yaml`
    #[arg(long, env = "KOPS_CA_BASE_PATH", default_value = "/etc/kubernetes/kops-controller/pki")]
    ca_base_path: PathBuf,

    /// Certificate names nodes may request
    #[arg(long, env = "KOPS_CERT_NAMES", value_delimiter = ',')]
    cert_names: Vec<String>,

    /// Directory with `cluster-completed.spec` and per-group nodeup configuration
    #[arg(long, env = "KOPS_NODE_CONFIG_BASE")]
    node_config_base: Option<PathBuf>,

    /// Verifiers consulted in order
    #[arg(long, env = "KOPS_VERIFIERS", value_enum, value_delimiter = ',', default_value = "pki")]
    verifiers: Vec<VerifierKind>,

    /// Seconds a PKI token timestamp may differ from the controller's clock
    #[arg(long, default_value_t = DEFAULT_MAX_TIME_SKEW.as_secs())]
    max_time_skew: u64,

    /// Seconds between re-reads of the published host records
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    hosts_poll_interval: u64,

    /// Log encoding (json or text)
    #[arg(long, env = "KOPS_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], KOPS_CONTROLLER_PORT))
}

/// Enabled certificate names, rejecting names with no profile
fn enabled_cert_names(configured: &[String]) -> anyhow::Result<BTreeSet<String>> {
    let names: BTreeSet<String> = if configured.is_empty() {
        DEFAULT_CERT_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        configured.iter().map(|s| s.trim().to_string()).collect()
    };
    if let Some(unknown) = names.iter().find(|n| CertProfile::from_name(n).is_none()) {
        anyhow::bail!("unknown certificate name {:?}", unknown);
    }
    Ok(names)
}

/// CAs the keystore must hold: every signer of an enabled name plus the cluster CA
fn required_cas(cert_names: &BTreeSet<String>) -> BTreeSet<&'static str> {
    cert_names
        .iter()
        .filter_map(|n| CertProfile::from_name(n))
        .map(|p| p.signer())
        .chain(std::iter::once(CLUSTER_CA))
        .collect()
}

fn build_verifier(
    cli: &Cli,
    client: Option<kube::Client>,
) -> anyhow::Result<Arc<dyn Verifier>> {
    let mut verifiers: Vec<Arc<dyn Verifier>> = Vec::with_capacity(cli.verifiers.len());
    for kind in &cli.verifiers {
        let verifier: Arc<dyn Verifier> = match kind {
            VerifierKind::Pki => {
                let client = client
                    .clone()
                    .context("the pki verifier needs Kubernetes access")?;
                Arc::new(PkiVerifier::new(
                    Arc::new(KubeHostKeyStore::new(client)),
                    Duration::from_secs(cli.max_time_skew),
                ))
            }
            VerifierKind::Hetzner => Arc::new(
                HetznerVerifier::from_env(cli.cluster_name.clone())
                    .context("configuring the hetzner verifier")?,
            ),
            VerifierKind::Digitalocean => Arc::new(
                DigitalOceanVerifier::from_env(&cli.cluster_name)
                    .context("configuring the digitalocean verifier")?,
            ),
        };
        verifiers.push(verifier);
    }
    if verifiers.is_empty() {
        anyhow::bail!("no verifiers configured");
    }
    Ok(Arc::new(VerifierChain::new(verifiers)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        service_name: "kops-controller".to_string(),
        format: cli.log_format,
    })?;

    let cert_names = enabled_cert_names(&cli.cert_names)?;
    let cas: Vec<&str> = required_cas(&cert_names).into_iter().collect();
    let keystore = Arc::new(
        Keystore::load_from_directory(&cli.ca_base_path, cas.as_slice())
            .with_context(|| format!("loading keystore from {}", cli.ca_base_path.display()))?,
    );
    for (ca, id) in signer_keypair_ids(&keystore, &cert_names) {
        info!(%ca, keypair_id = %id, "signing CA");
    }

    // Kubernetes is optional when only cloud verifiers run and no hosts are served
    let client = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "Kubernetes client unavailable");
            None
        }
    };

    let verifier = build_verifier(&cli, client.clone())?;
    let cluster_ca = keystore.find_primary_keypair(CLUSTER_CA)?.clone();
    let challenger = Arc::new(GrpcChallenger::new(cluster_ca, &cli.cluster_name));

    let mut state = BootstrapState::new(
        ServerOptions {
            cluster_name: cli.cluster_name.clone(),
            cert_names,
        },
        keystore,
        verifier.clone(),
        challenger,
    );
    if let Some(base) = &cli.node_config_base {
        state = state.with_node_configs(Arc::new(FileNodeConfigSource::new(base)));
    }

    let mut app = bootstrap_router(Arc::new(state));
    if let Some(client) = client {
        let discovery = DiscoveryService::new(verifier, Arc::new(ConfigMapHostsSource::new(client)))
            .with_poll_interval(Duration::from_secs(cli.hosts_poll_interval));
        let grpc = tonic::service::Routes::new(KopsControllerServiceServer::new(discovery))
            .into_axum_router();
        app = app.merge(grpc);
    }

    let cert_pem = tokio::fs::read(&cli.server_cert)
        .await
        .with_context(|| format!("reading {}", cli.server_cert.display()))?;
    let key_pem = tokio::fs::read(&cli.server_key)
        .await
        .with_context(|| format!("reading {}", cli.server_key.display()))?;
    let tls = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .context("invalid TLS certificate or key")?;

    info!(addr = %cli.listen, cluster = %cli.cluster_name, "kops-controller listening");
    axum_server::bind_rustls(cli.listen, tls)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server failed")?;

    Ok(())
}
