//! Hetzner Cloud identity token

use async_trait::async_trait;

use super::{fetch_metadata, metadata_client, Authenticator, METADATA_BASE_URL};
use crate::error::AuthError;
use crate::scheme;

/// Identifies the node by its Hetzner server ID from the metadata service
pub struct HetznerAuthenticator {
    http: reqwest::Client,
    metadata_url: String,
}

impl HetznerAuthenticator {
    /// Authenticator against the real metadata service
    pub fn new() -> Result<Self, AuthError> {
        Self::with_metadata_base(METADATA_BASE_URL)
    }

    /// Authenticator against a metadata service at `base`
    pub fn with_metadata_base(base: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: metadata_client()?,
            metadata_url: format!("{}/hetzner/v1/metadata/instance-id", base),
        })
    }
}

#[async_trait]
impl Authenticator for HetznerAuthenticator {
    async fn create_token(&self, _body: &[u8]) -> Result<String, AuthError> {
        let server_id = fetch_metadata(&self.http, &self.metadata_url).await?;
        Ok(format!("{}{}", scheme::HETZNER, server_id))
    }
}
