//! Wire types of the bootstrap protocol
//!
//! Field names follow the JSON the node and controller exchange; byte fields are
//! base64 encoded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of `POST /bootstrap`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    /// Must equal [`kops_common::BOOTSTRAP_API_VERSION`]
    pub api_version: String,
    /// Certificate name to PEM public key
    #[serde(default)]
    pub certs: BTreeMap<String, String>,
    /// CA name to the keypair ID the node expects to be signed with
    #[serde(default, rename = "keypairIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub keypair_ids: BTreeMap<String, String>,
    /// Ask the controller to return the instance group's node configuration
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_node_config: bool,
    /// Callback challenge offered by the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeOffer>,
}

/// Response to a successful bootstrap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    /// Certificate name to signed PEM certificate
    #[serde(default)]
    pub certs: BTreeMap<String, String>,
    /// Current keypair ID of every CA that signed one of `certs`
    #[serde(default, rename = "keypairIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub keypair_ids: BTreeMap<String, String>,
    /// Present when the request set `includeNodeConfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<NodeConfig>,
}

/// Per-instance-group configuration handed to nodeup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// nodeup configuration of the instance group (YAML)
    pub instance_group_config: String,
    /// Completed cluster specification (YAML)
    pub cluster_full_config: String,
}

/// Node-to-controller offer for the callback challenge
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeOffer {
    /// `host:port` the node listens on (informational; the controller dials the
    /// verified endpoint instead)
    pub endpoint: String,
    /// PEM CA that signed the node's challenge listener certificate
    #[serde(rename = "serverCA", with = "b64")]
    pub server_ca: Vec<u8>,
    /// 32 hex characters
    #[serde(rename = "challengeID")]
    pub challenge_id: String,
    /// 16 random bytes
    #[serde(with = "b64")]
    pub challenge_secret: Vec<u8>,
}

impl std::fmt::Debug for ChallengeOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeOffer")
            .field("endpoint", &self.endpoint)
            .field("challenge_id", &self.challenge_id)
            .field("challenge_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Envelope of a signed token: base64(JSON) after the scheme prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// JSON-encoded [`AuthTokenData`]
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Signature over `data`
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Claims bound by a signed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenData {
    /// Unix seconds when the token was created
    pub timestamp: i64,
    /// Must equal [`kops_common::AUDIENCE_NODE_AUTHENTICATION`]
    pub audience: String,
    /// sha256 of the request body
    #[serde(with = "b64")]
    pub request_hash: Vec<u8>,
    /// Name of the registered machine key
    #[serde(rename = "keyID", default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    /// Cloud instance ID, where the scheme has one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
}

/// Identity established by a successful verifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyResult {
    /// Kubernetes node name
    pub node_name: String,
    /// Instance group the node belongs to
    pub instance_group_name: String,
    /// Every address the cloud reports for the instance
    pub certificate_names: Vec<String>,
    /// `host:port` of the node's challenge listener
    pub challenge_endpoint: String,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
