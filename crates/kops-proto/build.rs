//! Service stubs are generated from hand-declared prost messages in `src/lib.rs`,
//! so the build does not need `protoc`.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn main() {
    let challenge = Service::builder()
        .name("Challenge")
        .package("kops.challenge.v1")
        .method(
            Method::builder()
                .name("challenge")
                .route_name("Challenge")
                .input_type("crate::ChallengeRequest")
                .output_type("crate::ChallengeResponse")
                .codec_path(CODEC)
                .build(),
        )
        .build();

    let controller = Service::builder()
        .name("KopsControllerService")
        .package("kops.controller.v1")
        .method(
            Method::builder()
                .name("discover_hosts")
                .route_name("DiscoverHosts")
                .input_type("crate::DiscoverHostsRequest")
                .output_type("crate::DiscoverHostsResponse")
                .codec_path(CODEC)
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[challenge, controller]);
    println!("cargo:rerun-if-changed=build.rs");
}
