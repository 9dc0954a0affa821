//! Node-side authenticators
//!
//! An authenticator turns a request body into an `Authorization` header value whose
//! prefix names the scheme, so the controller's verifier chain can dispatch on it.

mod digitalocean;
mod hetzner;
mod pki;

pub use digitalocean::DigitalOceanAuthenticator;
pub use hetzner::HetznerAuthenticator;
pub use pki::PkiAuthenticator;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::AuthError;

/// Link-local metadata service shared by the supported clouds
pub const METADATA_BASE_URL: &str = "http://169.254.169.254";

/// Creates bearer tokens proving the node's cloud identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Create the `Authorization` header value for a request carrying `body`
    async fn create_token(&self, body: &[u8]) -> Result<String, AuthError>;
}

/// Fetch a plain-text metadata value
async fn fetch_metadata(http: &reqwest::Client, url: &str) -> Result<String, AuthError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| AuthError::Sign(format!("querying metadata {}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(AuthError::Sign(format!(
            "metadata {} returned {}",
            url,
            response.status()
        )));
    }
    let text = response
        .text()
        .await
        .map_err(|e| AuthError::Sign(format!("reading metadata {}: {}", url, e)))?;
    let value = text.trim();
    if value.is_empty() {
        return Err(AuthError::Sign(format!("metadata {} was empty", url)));
    }
    Ok(value.to_string())
}

fn metadata_client() -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| AuthError::Sign(format!("building metadata client: {}", e)))
}
