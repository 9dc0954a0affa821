//! Callback challenge
//!
//! While handling `/bootstrap`, the controller dials back the node at the address
//! its cloud reports and asks it to hash the secret from its offer. This binds the
//! bootstrap request to a machine that really owns that address.
//!
//! The node side ([`ChallengeListener`]) serves with a throwaway CA whose PEM is
//! sent in the offer and only accepts clients presenting a cluster-CA certificate
//! for `kops-controller.<cluster>`. The controller side ([`GrpcChallenger`]) mints
//! that client certificate per call and trusts only the offered CA.

mod client;
mod server;

pub use client::{Challenger, GrpcChallenger};
pub use server::ChallengeListener;

#[cfg(test)]
pub use client::MockChallenger;

use aws_lc_rs::digest::{Context, SHA256};

/// Name the node's challenge certificate is issued for
pub const CHALLENGE_SERVER_NAME: &str = "challenge-server";

/// Length of a challenge ID in hex characters
pub const CHALLENGE_ID_LEN: usize = 32;

/// Length of the challenge secret and of the controller's random nonce
pub const CHALLENGE_SECRET_LEN: usize = 16;

/// Subject CN of the controller's challenge client certificate
pub fn controller_subject(cluster_name: &str) -> String {
    format!("kops-controller.{}", cluster_name)
}

/// `sha256(secret || random)`
pub fn challenge_response(secret: &[u8], random: &[u8]) -> Vec<u8> {
    let mut ctx = Context::new(&SHA256);
    ctx.update(secret);
    ctx.update(random);
    ctx.finish().as_ref().to_vec()
}

fn random_bytes(len: usize) -> Result<Vec<u8>, aws_lc_rs::error::Unspecified> {
    let mut bytes = vec![0u8; len];
    aws_lc_rs::rand::fill(&mut bytes)?;
    Ok(bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
