//! Errors of the bootstrap trust core
//!
//! Each side of the protocol has its own enum: [`VerifyError`] for controller-side
//! token verification, [`AuthError`] for node-side token creation, [`ChallengeError`]
//! for the callback, [`BootstrapError`] for the HTTP endpoint and [`ClientError`] for
//! the node's controller client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Why a verifier did not produce a [`crate::VerifyResult`]
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token is not for this verifier; the chain tries the next one
    #[error("token scheme not recognized")]
    WrongScheme,

    /// Malformed token, hash mismatch, wrong audience or bad signature
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Token timestamp outside the allowed skew
    #[error("token timestamp skew of {skew_secs}s exceeds {max_secs}s")]
    StaleTimestamp {
        /// Observed |now - timestamp|
        skew_secs: i64,
        /// Allowed skew
        max_secs: i64,
    },

    /// The cloud does not know the instance, or it is not part of this cluster
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// Cloud API call failed
    #[error("cloud API error: {0}")]
    CloudApi(String),
}

impl VerifyError {
    /// Returns true if the next verifier in a chain should be tried
    pub fn is_wrong_scheme(&self) -> bool {
        matches!(self, VerifyError::WrongScheme)
    }
}

/// Node-side token creation failure
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential backend failed to sign or identify
    #[error("sign error: {0}")]
    Sign(String),
}

/// Callback challenge failure
#[derive(Debug, Error)]
pub enum ChallengeError {
    /// The request carried no challenge offer
    #[error("request has no challenge")]
    Missing,

    /// The offer is malformed
    #[error("invalid challenge offer: {0}")]
    InvalidOffer(String),

    /// Could not mint the controller client certificate
    #[error("failed to create client certificate: {0}")]
    Credentials(String),

    /// Dialing or calling the node failed
    #[error("challenge call to {endpoint} failed: {message}")]
    Call {
        /// Endpoint dialed
        endpoint: String,
        /// Transport or status message
        message: String,
    },

    /// The node answered with the wrong response
    #[error("challenge response did not match")]
    Mismatch,
}

/// Errors returned by the `/bootstrap` endpoint
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The body could not be read
    #[error("failed to read request body: {0}")]
    ReadBody(String),

    /// Token verification failed
    #[error("failed to verify token: {0}")]
    Unauthorized(#[from] VerifyError),

    /// Callback challenge failed
    #[error("challenge failed: {0}")]
    ChallengeFailed(#[from] ChallengeError),

    /// Unparseable body, wrong API version, unknown certificate name, bad key
    #[error("{0}")]
    MalformedRequest(String),

    /// Signing failed or a CA is missing from the keystore
    #[error("failed to issue certificate: {0}")]
    Issue(String),

    /// Anything else, including a recovered panic
    #[error("internal error: {0}")]
    Internal(String),
}

impl BootstrapError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            BootstrapError::ReadBody(_) | BootstrapError::MalformedRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            BootstrapError::Unauthorized(_) | BootstrapError::ChallengeFailed(_) => {
                StatusCode::FORBIDDEN
            }
            BootstrapError::Issue(_) | BootstrapError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BootstrapError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            BootstrapError::Unauthorized(_) | BootstrapError::ChallengeFailed(_) => {
                "failed to verify token".to_string()
            }
            BootstrapError::Issue(_) | BootstrapError::Internal(_) => "internal error".to_string(),
            _ => self.to_string(),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Node-side controller client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// The controller name resolves only to placeholder addresses; retry later
    #[error("kops-controller DNS not set up yet ({0}), try again later")]
    TryAgainLater(String),

    /// Resolution or dialing failed
    #[error("failed to reach kops-controller: {0}")]
    Transport(String),

    /// The authenticator could not create a token
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The controller answered with a non-200 status
    #[error("bootstrap returned status {status}: {detail}")]
    Status {
        /// HTTP status code
        status: u16,
        /// First line of the response body
        detail: String,
    },

    /// Response body could not be decoded
    #[error("invalid response from kops-controller: {0}")]
    InvalidResponse(String),

    /// gRPC call failed
    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),
}

impl ClientError {
    /// Returns true if the caller should back off and retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::TryAgainLater(_) | ClientError::Transport(_)
        ) || matches!(self, ClientError::Status { status, .. } if *status >= 500)
    }
}
