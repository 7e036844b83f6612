use std::path::{Path, PathBuf};

use weir_types::ContainerId;

use crate::error::ContentResult;

/// Configuration for the content store.
#[derive(Clone, Debug)]
pub struct ContentConfig {
    /// Maximum container size in bytes before rotation (default: 1 GiB).
    pub max_container_size: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            max_container_size: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// Path of a container's backing file.
pub(crate) fn container_path(dir: &Path, id: ContainerId) -> PathBuf {
    dir.join(format!("container-{}.bin", id.as_u64()))
}

/// Path of a container's sidecar index.
pub(crate) fn index_path(dir: &Path, id: ContainerId) -> PathBuf {
    dir.join(format!("container-{}.idx", id.as_u64()))
}

/// List the ids of all container files present in a directory.
pub(crate) fn scan_container_ids(dir: &Path) -> ContentResult<Vec<ContainerId>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rest) = name
            .strip_prefix("container-")
            .and_then(|s| s.strip_suffix(".bin"))
        {
            if let Ok(raw) = rest.parse::<u64>() {
                ids.push(ContainerId::new(raw));
            }
        }
    }
    ids.sort();
    Ok(ids)
}
