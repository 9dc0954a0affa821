//! kops-nodeup - obtains node certificates from kops-controller
//!
//! Starts the challenge listener, proves the node's identity with the selected
//! authenticator, writes the issued certificates, then optionally keeps the
//! managed `/etc/hosts` block in sync with the controller.

mod bootstrap;
mod hosts_sync;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use kops_bootstrap::authn::{DigitalOceanAuthenticator, HetznerAuthenticator, PkiAuthenticator};
use kops_bootstrap::{Authenticator, ChallengeListener, KopsControllerClient};
use kops_common::retry::RetryConfig;
use kops_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kops_common::{KOPS_CONTROLLER_PORT, NODEUP_CHALLENGE_PORT};
use kops_pki::rsa_key_size_from_env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How the node proves its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthenticatorKind {
    /// Enrolled machine key on disk
    Pki,
    /// Hetzner Cloud metadata
    Hetzner,
    /// DigitalOcean metadata
    Digitalocean,
}

/// kops-nodeup bootstrap client
#[derive(Parser, Debug)]
#[command(name = "kops-nodeup", version, about, long_about = None)]
struct Cli {
    /// Name of the cluster the node joins
    #[arg(long, env = "KOPS_CLUSTER_NAME")]
    cluster_name: String,

    /// kops-controller base URL; derived from the cluster name when unset
    #[arg(long, env = "KOPS_CONTROLLER_URL")]
    controller_url: Option<String>,

    /// PEM bundle of the CAs trusted for the controller and its challenge calls
    #[arg(long, env = "KOPS_CA_FILE", default_value = "/srv/kubernetes/ca.crt")]
    ca_file: PathBuf,

    /// Address the challenge listener binds
    #[arg(long, env = "KOPS_CHALLENGE_LISTEN", default_value_t = default_challenge_listen())]
    challenge_listen: SocketAddr,

    /// Identity proof to present
    #[arg(long, env = "KOPS_AUTHENTICATOR", value_enum)]
    authenticator: AuthenticatorKind,

    /// Machine key for the pki authenticator
    #[arg(long, env = "KOPS_MACHINE_KEY", default_value = "/etc/kops/machine-key.pem")]
    machine_key: PathBuf,

    /// Key ID the machine key was enrolled under (usually the node name)
    #[arg(long, env = "KOPS_MACHINE_KEY_ID")]
    machine_key_id: Option<String>,

    /// Certificates to request
    #[arg(
        long,
        env = "KOPS_CERT_NAMES",
        value_delimiter = ',',
        default_value = "kubelet,kube-proxy"
    )]
    cert_names: Vec<String>,

    /// Ask the controller for the instance group's configuration
    #[arg(long)]
    include_node_config: bool,

    /// Directory receiving keys, certificates and configuration
    #[arg(long, env = "KOPS_OUTPUT_DIR", default_value = "/var/lib/kops/bootstrap")]
    output_dir: PathBuf,

    /// Keep the managed block of this hosts file in sync after bootstrap
    #[arg(long, env = "KOPS_SYNC_HOSTS")]
    sync_hosts: Option<PathBuf>,

    /// Log encoding (json or text)
    #[arg(long, env = "KOPS_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

fn default_challenge_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], NODEUP_CHALLENGE_PORT))
}

impl Cli {
    fn controller_url(&self) -> String {
        self.controller_url.clone().unwrap_or_else(|| {
            format!(
                "https://kops-controller.internal.{}:{}",
                self.cluster_name, KOPS_CONTROLLER_PORT
            )
        })
    }

    fn build_authenticator(&self) -> anyhow::Result<Arc<dyn Authenticator>> {
        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            AuthenticatorKind::Pki => {
                let key_id = self
                    .machine_key_id
                    .clone()
                    .context("--machine-key-id is required with the pki authenticator")?;
                Arc::new(PkiAuthenticator::load(key_id, &self.machine_key)?)
            }
            AuthenticatorKind::Hetzner => Arc::new(HetznerAuthenticator::new()?),
            AuthenticatorKind::Digitalocean => Arc::new(DigitalOceanAuthenticator::new()?),
        };
        Ok(authenticator)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        service_name: "kops-nodeup".to_string(),
        format: cli.log_format,
    })?;

    let ca_pem = tokio::fs::read_to_string(&cli.ca_file)
        .await
        .with_context(|| format!("reading {}", cli.ca_file.display()))?;
    let client = Arc::new(KopsControllerClient::new(
        &cli.controller_url(),
        ca_pem.clone(),
        cli.build_authenticator()?,
    )?);

    let keys = bootstrap::generate_keys(&cli.cert_names, rsa_key_size_from_env())?;
    let request = bootstrap::build_request(&keys, cli.include_node_config);

    let challenge = ChallengeListener::new(&cli.cluster_name)?;
    let tcp = tokio::net::TcpListener::bind(cli.challenge_listen)
        .await
        .with_context(|| format!("binding challenge listener on {}", cli.challenge_listen))?;
    let endpoint = tcp.local_addr()?.to_string();

    let shutdown = CancellationToken::new();
    let listener_task = {
        let challenge = challenge.clone();
        let ca_pem = ca_pem.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = challenge
                .serve(tcp, &ca_pem, shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "challenge listener failed");
            }
        })
    };

    let result = bootstrap::request_with_retry(
        &client,
        &challenge,
        &endpoint,
        &request,
        &RetryConfig::default(),
    )
    .await;

    shutdown.cancel();
    if let Err(e) = listener_task.await {
        error!(error = %e, "challenge listener task panicked");
    }

    let response = result.context("bootstrap failed")?;
    bootstrap::write_outputs(&cli.output_dir, &keys, &response).await?;
    info!(certs = response.certs.len(), "bootstrap complete");

    if let Some(path) = cli.sync_hosts.clone() {
        let cancel = CancellationToken::new();
        let sync = tokio::spawn(hosts_sync::run(client, path, cancel.clone()));
        tokio::signal::ctrl_c().await?;
        info!("shutting down hosts sync");
        cancel.cancel();
        if let Err(e) = sync.await {
            error!(error = %e, "hosts sync task panicked");
        }
    }

    Ok(())
}
