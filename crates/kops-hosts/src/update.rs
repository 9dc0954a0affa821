//! Read-modify-write of the managed block
//!
//! `/etc/hosts` is bind-mounted into the nodeup container, so it cannot be
//! replaced with a rename. Writes go in place and are verified by reading the file
//! back after a short random pause; a mismatch means another writer raced us and
//! the write is repeated.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HostsError, Result};
use crate::hostmap::HostMap;
use crate::{BEGIN_MARKER, END_MARKER};

/// Writes attempted before giving up
pub const MAX_WRITE_ATTEMPTS: usize = 10;

/// Serializes updates made by this process
static UPDATE_LOCK: Mutex<()> = Mutex::const_new(());

/// Split file content into lines outside the managed block and lines inside it
///
/// Mis-nested markers are logged and tolerated. Trailing blank lines of the outside
/// part are dropped.
pub fn split_guarded_block(content: &str) -> (Vec<String>, Vec<String>) {
    let mut outside = Vec::new();
    let mut guarded = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        match line.trim() {
            BEGIN_MARKER => {
                if in_block {
                    warn!("found duplicate begin marker in hosts file");
                }
                in_block = true;
            }
            END_MARKER => {
                if !in_block {
                    warn!("found end marker without begin marker in hosts file");
                }
                in_block = false;
            }
            _ if in_block => guarded.push(line.to_string()),
            _ => outside.push(line.to_string()),
        }
    }
    if in_block {
        warn!("hosts file block was not terminated");
    }

    while outside.last().is_some_and(|l| l.trim().is_empty()) {
        outside.pop();
    }
    (outside, guarded)
}

fn render(outside: &[String], map: &HostMap) -> String {
    let mut out = String::new();
    for line in outside {
        out.push_str(line);
        out.push('\n');
    }
    if !outside.is_empty() {
        out.push('\n');
    }
    out.push_str(BEGIN_MARKER);
    out.push('\n');
    for line in map.to_lines() {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(END_MARKER);
    out.push('\n');
    out
}

async fn read(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(HostsError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Apply `mutator` to the managed block of the hosts file at `path`
pub async fn update<F>(path: impl AsRef<Path>, mutator: F) -> Result<()>
where
    F: FnOnce(&mut HostMap),
{
    let path = path.as_ref();
    let _guard = UPDATE_LOCK.lock().await;

    let existing = read(path).await?;
    let (outside, guarded) = split_guarded_block(&existing);
    let (mut map, bad_lines) = HostMap::parse(&guarded);
    for line in &bad_lines {
        warn!(line = %line, "dropping unparseable line from managed hosts block");
    }

    mutator(&mut map);

    let desired = render(&outside, &map);
    if desired == existing {
        debug!(path = %path.display(), "hosts file unchanged");
        return Ok(());
    }

    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        tokio::fs::write(path, &desired)
            .await
            .map_err(|source| HostsError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let pause = Duration::from_millis(rand::thread_rng().gen_range(1..=20));
        tokio::time::sleep(pause).await;

        if read(path).await? == desired {
            info!(path = %path.display(), records = map.to_lines().len(), "updated hosts file");
            return Ok(());
        }
        debug!(attempt, "hosts file changed during write, retrying");
    }

    Err(HostsError::TooManyRetries {
        path: path.display().to_string(),
        attempts: MAX_WRITE_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTSIDE: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost\n";

    fn set_api(map: &mut HostMap) {
        map.replace_records("api.internal.c1", &["10.0.0.2", "10.0.0.1"]);
    }

    #[tokio::test]
    async fn writes_block_after_existing_content() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("hosts");
        std::fs::write(&path, OUTSIDE).expect("write hosts");

        update(&path, set_api).await.expect("update should succeed");

        let content = std::fs::read_to_string(&path).expect("read hosts");
        assert_eq!(
            content,
            format!(
                "{}\n{}\n10.0.0.1\tapi.internal.c1\n10.0.0.2\tapi.internal.c1\n{}\n",
                OUTSIDE, BEGIN_MARKER, END_MARKER
            )
        );
    }

    #[tokio::test]
    async fn replaces_existing_block_and_keeps_outside() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            format!(
                "{}\n{}\n10.0.0.7\tapi.internal.c1\n10.0.0.8\tnode-b\n{}\n\n\n",
                OUTSIDE, BEGIN_MARKER, END_MARKER
            ),
        )
        .expect("write hosts");

        update(&path, set_api).await.expect("update should succeed");

        let content = std::fs::read_to_string(&path).expect("read hosts");
        let (outside, guarded) = split_guarded_block(&content);
        assert_eq!(outside.join("\n") + "\n", OUTSIDE);
        assert_eq!(
            guarded,
            vec![
                "10.0.0.1\tapi.internal.c1",
                "10.0.0.2\tapi.internal.c1",
                "10.0.0.8\tnode-b"
            ]
        );
    }

    #[tokio::test]
    async fn unchanged_content_is_not_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("hosts");
        std::fs::write(&path, OUTSIDE).expect("write hosts");

        update(&path, set_api).await.expect("first update should succeed");
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .expect("mtime");
        tokio::time::sleep(Duration::from_millis(20)).await;
        update(&path, set_api).await.expect("second update should succeed");
        let again = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .expect("mtime");
        assert_eq!(modified, again);
    }

    #[tokio::test]
    async fn missing_file_gets_only_the_block() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("hosts");

        update(&path, |map| map.add_record("10.0.0.2", "api.internal.c1"))
            .await
            .expect("update should succeed");

        let content = std::fs::read_to_string(&path).expect("read hosts");
        assert_eq!(
            content,
            format!("{}\n10.0.0.2\tapi.internal.c1\n{}\n", BEGIN_MARKER, END_MARKER)
        );
    }

    #[tokio::test]
    async fn concurrent_updates_match_single_update() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let reference = dir.path().join("reference");
        let shared = dir.path().join("shared");
        std::fs::write(&reference, OUTSIDE).expect("write hosts");
        std::fs::write(&shared, OUTSIDE).expect("write hosts");

        update(&reference, set_api).await.expect("update should succeed");

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let path = shared.clone();
                tokio::spawn(async move { update(&path, set_api).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result
                .expect("task should not panic")
                .expect("update should succeed");
        }

        assert_eq!(
            std::fs::read(&shared).expect("read shared"),
            std::fs::read(&reference).expect("read reference")
        );
    }

    #[test]
    fn mis_nested_markers_are_recovered() {
        let content = format!(
            "a\n{end}\n{begin}\n10.0.0.1 x\n{begin}\n10.0.0.2 y\n",
            begin = BEGIN_MARKER,
            end = END_MARKER
        );
        let (outside, guarded) = split_guarded_block(&content);
        assert_eq!(outside, vec!["a"]);
        assert_eq!(guarded, vec!["10.0.0.1 x", "10.0.0.2 y"]);
    }
}
