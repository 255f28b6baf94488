//! Atomic file primitives shared by every store.
//!
//! Records are never patched in place: each write serializes the whole
//! record to a temp file in the target's directory and renames it over the
//! canonical path. Readers see either the old file or the new one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp path next to `target`, unique per process, instant and call.
fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(
        ".{file_name}.{}.{nanos}.{seq}.tmp",
        std::process::id()
    ))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Atomically replace `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = temp_path_for(path);

    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp).await
            && cleanup.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
        }
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Read and parse a JSON record. A missing file is `Ok(None)`; an unparsable
/// one is `Corrupted`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Delete a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
