//! DigitalOcean droplet identity token

use async_trait::async_trait;

use super::{fetch_metadata, metadata_client, Authenticator, METADATA_BASE_URL};
use crate::error::AuthError;
use crate::scheme;

/// Identifies the node by its droplet ID from the metadata service
pub struct DigitalOceanAuthenticator {
    http: reqwest::Client,
    metadata_url: String,
}

impl DigitalOceanAuthenticator {
    /// Authenticator against the real metadata service
    pub fn new() -> Result<Self, AuthError> {
        Self::with_metadata_base(METADATA_BASE_URL)
    }

    /// Authenticator against a metadata service at `base`
    pub fn with_metadata_base(base: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: metadata_client()?,
            metadata_url: format!("{}/metadata/v1/id", base),
        })
    }
}

#[async_trait]
impl Authenticator for DigitalOceanAuthenticator {
    async fn create_token(&self, _body: &[u8]) -> Result<String, AuthError> {
        let droplet_id = fetch_metadata(&self.http, &self.metadata_url).await?;
        Ok(format!("{}{}", scheme::DIGITALOCEAN, droplet_id))
    }
}
