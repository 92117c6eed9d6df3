use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

/// Resolve the agent data directory in a platform-appropriate location.
/// `STEWARD_DATA_DIR` wins when set.
pub fn agent_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("STEWARD_DATA_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("steward-agent")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agent.toml")
}

pub fn spec_path(data_dir: &Path) -> PathBuf {
    data_dir.join("spec.json")
}

pub fn tasks_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tasks.json")
}

pub fn health_path(data_dir: &Path) -> PathBuf {
    data_dir.join("health.json")
}

pub fn boot_marker_path(data_dir: &Path) -> PathBuf {
    data_dir.join("boot.json")
}

pub fn node_key_path(data_dir: &Path) -> PathBuf {
    data_dir.join("node.key")
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Write a JSON document via a sibling temp file and rename, so readers never see a torn file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
