//! Helpers shared by the crate's tests

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Json;
use kops_pki::{Keypair, Keystore};

/// Serve `router` on an ephemeral loopback port and return its base URL
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr should be known");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Keystore holding both signing CAs with known keypair IDs
pub fn test_keystore() -> Keystore {
    Keystore::from_keypairs(
        [
            (
                "kubernetes-ca".to_string(),
                Keypair::generate_ca("kubernetes-ca").expect("CA generation should succeed"),
            ),
            (
                "etcd-clients-ca-cilium".to_string(),
                Keypair::generate_ca("etcd-clients-ca-cilium")
                    .expect("CA generation should succeed"),
            ),
        ],
        BTreeMap::from([
            ("kubernetes-ca".to_string(), "7001".to_string()),
            ("etcd-clients-ca-cilium".to_string(), "7002".to_string()),
        ]),
    )
}

/// Fake Hetzner API knowing server 12345 in cluster `c1.example.com`
pub async fn fake_hetzner_api() -> String {
    let router = axum::Router::new().route(
        "/v1/servers/{id}",
        get(|Path(id): Path<u64>, headers: HeaderMap| async move {
            if headers.get("authorization").and_then(|v| v.to_str().ok())
                != Some("Bearer secret")
            {
                return Err(StatusCode::UNAUTHORIZED);
            }
            let cluster = match id {
                12345 => "c1.example.com",
                23456 => "other.example.com",
                _ => return Err(StatusCode::NOT_FOUND),
            };
            Ok(Json(serde_json::json!({
                "server": {
                    "id": id,
                    "name": "nodes-fsn1-5d4a",
                    "labels": {
                        "kops.k8s.io/cluster": cluster,
                        "kops.k8s.io/instance-group": "nodes-fsn1",
                    },
                    "public_net": {"ipv4": {"ip": "203.0.113.9"}, "ipv6": null},
                    "private_net": [{"ip": "10.0.0.7", "network": 1}],
                }
            })))
        }),
    );
    serve(router).await
}

