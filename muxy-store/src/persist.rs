//! Last-known-good cluster persistence.
//!
//! Every accepted config is serialized to `save_path` so a restart
//! during a REST outage can come up with the previous layout. The file
//! is written atomically: first to a `.tmp` sibling, then renamed over
//! the final path, so a crash mid-write never corrupts the stored
//! state.

use muxy_core::ClusterConfig;
use std::path::Path;

/// Save `cluster` to `path`. Logs a warning rather than failing the
/// caller on I/O errors — persistence is best-effort.
pub fn save_cluster(path: &Path, cluster: &ClusterConfig) {
    let json = match serde_json::to_string_pretty(cluster) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "persist: failed to serialize cluster");
            return;
        }
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(error = %e, dir = %parent.display(), "persist: failed to create state dir");
        return;
    }

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, &json) {
        tracing::warn!(error = %e, path = %tmp.display(), "persist: failed to write tmp file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        tracing::warn!(error = %e, "persist: failed to rename tmp → state file");
    }
}

/// Load the saved cluster, if any. A missing or unparsable file is a
/// `None` (and a log line), never an error: bootstrap falls through to
/// its other sources.
pub fn load_cluster(path: &Path) -> Option<ClusterConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "persist: no saved cluster");
            return None;
        }
    };
    match serde_json::from_str::<ClusterConfig>(&raw) {
        Ok(cluster) => match cluster.validate() {
            Ok(()) => Some(cluster),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persist: saved cluster is invalid");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "persist: saved cluster is unreadable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxy_core::cluster::BackendKind;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("muxy-persist-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn save_then_load_roundtrip() {
        let path = tmp_path("roundtrip.json");
        let cluster = ClusterConfig::parse_server_list("a:11211,b:11212:2").unwrap();
        save_cluster(&path, &cluster);

        let loaded = load_cluster(&path).expect("saved cluster loads back");
        assert_eq!(loaded.kind, BackendKind::Ketama);
        assert_eq!(loaded.servers, cluster.servers);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_is_none() {
        assert!(load_cluster(Path::new("/nonexistent/muxy-no-such-state.json")).is_none());
    }

    #[test]
    fn load_garbage_is_none() {
        let path = tmp_path("garbage.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load_cluster(&path).is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_leaves_no_tmp_file() {
        let path = tmp_path("atomic.json");
        let cluster = ClusterConfig::parse_server_list("a:11211").unwrap();
        save_cluster(&path, &cluster);
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists(), "tmp file renamed away");
        let _ = std::fs::remove_file(&path);
    }
}
