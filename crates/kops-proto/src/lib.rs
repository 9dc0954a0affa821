//! gRPC definitions shared by kops-controller and nodeup.
//!
//! Two services travel over separate channels:
//!
//! - `kops.challenge.v1.Challenge` is served by nodeup on the node-challenge port and
//!   called by the controller while it handles `/bootstrap`. The node proves it holds
//!   the secret from its challenge offer by answering `sha256(secret || random)`.
//! - `kops.controller.v1.KopsControllerService` is served by the controller next to
//!   `/bootstrap` and streams the authoritative host list to nodes.

// Generated service code doesn't have docs
#![allow(missing_docs)]

/// Controller → node challenge call
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeRequest {
    /// ID the node chose for this bootstrap attempt
    #[prost(string, tag = "1")]
    pub challenge_id: ::prost::alloc::string::String,
    /// Fresh random bytes chosen by the controller
    #[prost(bytes = "vec", tag = "2")]
    pub challenge_random: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeResponse {
    /// `sha256(challenge_secret || challenge_random)`
    #[prost(bytes = "vec", tag = "1")]
    pub challenge_response: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoverHostsRequest {}

/// One snapshot of the host records known to the controller
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoverHostsResponse {
    #[prost(message, repeated, tag = "1")]
    pub records: ::prost::alloc::vec::Vec<HostRecord>,
    /// True when `records` is the complete set rather than a delta
    #[prost(bool, tag = "2")]
    pub complete: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostRecord {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub addresses: ::prost::alloc::vec::Vec<Address>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub address: ::prost::alloc::string::String,
}

/// Node challenge service
pub mod challenge {
    include!(concat!(env!("OUT_DIR"), "/kops.challenge.v1.Challenge.rs"));
}

/// Controller services used by nodes
pub mod controller {
    include!(concat!(env!("OUT_DIR"), "/kops.controller.v1.KopsControllerService.rs"));
}

pub use challenge::challenge_client::ChallengeClient;
pub use challenge::challenge_server::{Challenge, ChallengeServer};
pub use controller::kops_controller_service_client::KopsControllerServiceClient;
pub use controller::kops_controller_service_server::{
    KopsControllerService, KopsControllerServiceServer,
};
