//! Node bootstrap trust core
//!
//! A booting node proves its cloud identity to kops-controller and receives signed
//! certificates and its instance group's configuration:
//!
//! ```text
//!  nodeup                                   kops-controller
//!  ──────                                   ───────────────
//!  ChallengeListener::create_challenge
//!  Authenticator::create_token(body)
//!  KopsControllerClient::bootstrap ──POST /bootstrap──▶ VerifierChain::verify_token
//!                                  ◀──Challenge RPC──── GrpcChallenger
//!                                                      issue_cert per name
//!                                  ◀──certs, config──
//! ```
//!
//! After bootstrap, nodes stream `/etc/hosts` records over
//! `KopsControllerService.DiscoverHosts`, authenticated with the same tokens.

pub mod authn;
pub mod challenge;
pub mod client;
pub mod discovery;
pub mod error;
pub mod model;
pub mod resolver;
pub mod server;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use authn::Authenticator;
pub use challenge::{ChallengeListener, Challenger, GrpcChallenger};
pub use client::KopsControllerClient;
pub use discovery::{ConfigMapHostsSource, DiscoveryService, HostsSource};
pub use error::{AuthError, BootstrapError, ChallengeError, ClientError, VerifyError};
pub use model::{
    AuthToken, AuthTokenData, BootstrapRequest, BootstrapResponse, ChallengeOffer, NodeConfig,
    VerifyResult,
};
pub use resolver::{Resolver, StaticResolver};
pub use server::{
    bootstrap_router, BootstrapState, FileNodeConfigSource, NodeConfigSource, ServerOptions,
};
pub use verify::{RequestContext, Verifier, VerifierChain};

/// Token prefixes, one per authentication scheme
pub mod scheme {
    /// ECDSA machine key token
    pub const PKI: &str = "x-pki-tpm ";
    /// Hetzner server ID
    pub const HETZNER: &str = "x-hetzner-id ";
    /// DigitalOcean droplet ID
    pub const DIGITALOCEAN: &str = "x-digitalocean-droplet-id ";
}

/// sha256 of a request body
pub fn request_hash(body: &[u8]) -> Vec<u8> {
    aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, body)
        .as_ref()
        .to_vec()
}
