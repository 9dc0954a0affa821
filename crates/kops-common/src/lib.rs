//! Shared building blocks for the kops controller, nodeup and the rolling-update engine.
//!
//! Holds the well-known ports, API constants and label keys that both sides of the
//! bootstrap protocol must agree on, plus the common error taxonomy, retry helper and
//! logging setup.

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::{Error, Result};

/// Port kops-controller serves `/bootstrap` and the gRPC discovery service on
pub const KOPS_CONTROLLER_PORT: u16 = 3988;

/// Port the nodeup challenge listener binds on every booting node
pub const NODEUP_CHALLENGE_PORT: u16 = 3989;

/// API version of the bootstrap envelope; requests carrying anything else are rejected
pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.kops.k8s.io/v1alpha1";

/// Audience every signed node token must be bound to
pub const AUDIENCE_NODE_AUTHENTICATION: &str = "kops.k8s.io/node-bootstrap";

/// IPv4 address DNS records point at until dns-controller publishes the real ones
pub const PLACEHOLDER_IP: &str = "203.0.113.123";

/// IPv6 counterpart of [`PLACEHOLDER_IP`]
pub const PLACEHOLDER_IPV6: &str = "fd00:dead:add::";

/// Name of the primary cluster CA in the keystore
pub const CERTIFICATE_ID_CA: &str = "kubernetes-ca";

/// Taint applied to nodes that are about to be replaced
pub const ROLLING_UPDATE_TAINT_KEY: &str = "kops.k8s.io/scheduled-for-update";

/// Namespace holding kops-owned resources such as enrolled `Host` objects
pub const KOPS_SYSTEM_NAMESPACE: &str = "kops-system";

/// Field manager used for every patch issued against the Kubernetes API
pub const FIELD_MANAGER: &str = "kops-controller";

/// Returns true if `ip` is one of the placeholder addresses
pub fn is_placeholder_ip(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.to_string() == PLACEHOLDER_IP,
        std::net::IpAddr::V6(v6) => PLACEHOLDER_IPV6
            .parse::<std::net::Ipv6Addr>()
            .map(|p| p == *v6)
            .unwrap_or(false),
    }
}
