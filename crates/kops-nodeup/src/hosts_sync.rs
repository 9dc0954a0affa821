//! Keeps the managed `/etc/hosts` block in step with the controller's records

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kops_bootstrap::KopsControllerClient;
use kops_hosts::HostMap;
use kops_proto::DiscoverHostsResponse;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before reopening a failed or closed stream
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Apply one stream message to the managed block
///
/// A complete snapshot replaces the block; otherwise each listed name has its
/// addresses replaced and every other name is left alone.
pub fn apply_update(map: &mut HostMap, update: &DiscoverHostsResponse) {
    if update.complete {
        map.clear();
    }
    for record in &update.records {
        let addresses: Vec<&str> = record.addresses.iter().map(|a| a.address.as_str()).collect();
        map.replace_records(&record.name, &addresses);
    }
}

/// Stream host records into `path` until `cancel` fires
pub async fn run(client: Arc<KopsControllerClient>, path: PathBuf, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = follow_stream(&client, &path) => match result {
                Ok(()) => debug!("host discovery stream ended"),
                Err(e) => warn!(error = %e, "host discovery failed"),
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn follow_stream(client: &KopsControllerClient, path: &Path) -> anyhow::Result<()> {
    let mut stream = client.discover_hosts().await?;
    info!(path = %path.display(), "following host records");
    while let Some(update) = stream.message().await? {
        debug!(records = update.records.len(), complete = update.complete, "host records received");
        kops_hosts::update(path, |map| apply_update(map, &update)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kops_proto::{Address, HostRecord};

    fn record(name: &str, addresses: &[&str]) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            addresses: addresses
                .iter()
                .map(|a| Address {
                    address: a.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn complete_snapshot_replaces_block() {
        let mut map = HostMap::default();
        map.add_record("10.0.0.9", "stale.internal");

        apply_update(
            &mut map,
            &DiscoverHostsResponse {
                records: vec![record("api.internal", &["10.0.0.1", "10.0.0.2"])],
                complete: true,
            },
        );

        assert!(map.addresses("stale.internal").is_empty());
        assert_eq!(map.addresses("api.internal"), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn partial_update_only_touches_listed_names() {
        let mut map = HostMap::default();
        map.add_record("10.0.0.9", "keep.internal");
        map.add_record("10.0.0.1", "api.internal");

        apply_update(
            &mut map,
            &DiscoverHostsResponse {
                records: vec![record("api.internal", &["10.0.0.5"])],
                complete: false,
            },
        );

        assert_eq!(map.addresses("keep.internal"), vec!["10.0.0.9"]);
        assert_eq!(map.addresses("api.internal"), vec!["10.0.0.5"]);
    }

    #[tokio::test]
    async fn updates_land_in_the_hosts_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1 localhost\n")
            .await
            .expect("seed write should succeed");

        let update = DiscoverHostsResponse {
            records: vec![record("api.internal", &["10.0.0.1"])],
            complete: true,
        };
        kops_hosts::update(&path, |map| apply_update(map, &update))
            .await
            .expect("update should succeed");

        let content = tokio::fs::read_to_string(&path)
            .await
            .expect("read should succeed");
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        assert!(content.contains("10.0.0.1\tapi.internal\n"));
        assert!(content.contains(kops_hosts::BEGIN_MARKER));
    }
}
