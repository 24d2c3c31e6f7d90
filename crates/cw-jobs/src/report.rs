use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// Write `value` as pretty JSON to `<root>/<run>/<file_name>` and return the path.
pub(crate) async fn write_json_report<T: Serialize>(
    root: &Path,
    run: &str,
    file_name: &str,
    value: &T,
) -> Result<PathBuf> {
    let dir = root.join(run);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {file_name}"))?;
    let path = dir.join(file_name);
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
