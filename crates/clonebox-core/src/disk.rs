//! Disk image lifecycle on the host filesystem (spec §4.4). Shells out to
//! `qemu-img` through the Process Runner — the Disk Manager never spawns
//! a subprocess itself.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::process::{self, RunRequest};

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
pub struct DiskInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size")]
    pub actual_size: u64,
    pub format: String,
    #[serde(rename = "backing-filename")]
    pub backing: Option<String>,
}

pub struct DiskManager;

impl DiskManager {
    /// Creates an image at `path`. When `backing` is given, creates a
    /// copy-on-write overlay; fails if `path` already exists (spec:
    /// "fails if target already exists").
    pub async fn create(
        path: &str,
        size_bytes: u64,
        format: &str,
        backing: Option<&str>,
    ) -> Result<()> {
        if Path::new(path).exists() {
            return Err(Error::already_exists("disk_image", path));
        }
        if let Some(backing_path) = backing {
            if !Path::new(backing_path).exists() {
                return Err(Error::InvalidArgument(format!(
                    "backing file does not exist: {backing_path}"
                )));
            }
            let backing_info = Self::info(backing_path).await?;
            if size_bytes < backing_info.virtual_size {
                return Err(Error::InvalidArgument(format!(
                    "overlay size {size_bytes} must be >= backing virtual size {}",
                    backing_info.virtual_size
                )));
            }
        }

        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut argv = vec!["qemu-img".to_string(), "create".to_string(), "-f".to_string(), format.to_string()];
        if let Some(backing_path) = backing {
            argv.push("-F".to_string());
            argv.push(Self::info(backing_path).await?.format);
            argv.push("-b".to_string());
            argv.push(backing_path.to_string());
        }
        argv.push(path.to_string());
        argv.push(size_bytes.to_string());

        let out = process::run(RunRequest::new(argv).timeout(QEMU_IMG_TIMEOUT)).await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "qemu-img".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        info!(path, size_bytes, backing = ?backing, "disk: created");
        Ok(())
    }

    /// Expands only; shrink is forbidden.
    pub async fn resize(path: &str, new_size_bytes: u64) -> Result<()> {
        let current = Self::info(path).await?;
        if new_size_bytes < current.virtual_size {
            return Err(Error::InvalidArgument(format!(
                "cannot shrink disk from {} to {new_size_bytes}",
                current.virtual_size
            )));
        }
        if new_size_bytes == current.virtual_size {
            debug!(path, "disk: resize to current size is a no-op");
            return Ok(());
        }
        let out = process::run(
            RunRequest::new([
                "qemu-img",
                "resize",
                path,
                &new_size_bytes.to_string(),
            ])
            .timeout(QEMU_IMG_TIMEOUT),
        )
        .await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "qemu-img".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        info!(path, new_size_bytes, "disk: resized");
        Ok(())
    }

    pub async fn info(path: &str) -> Result<DiskInfo> {
        let out = process::run(
            RunRequest::new(["qemu-img", "info", "--output=json", path])
                .timeout(Duration::from_secs(30)),
        )
        .await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "qemu-img".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        Ok(serde_json::from_slice(&out.stdout)?)
    }

    /// Creates an external snapshot file and returns its path.
    pub async fn snapshot(path: &str, snapshot_name: &str) -> Result<String> {
        let snapshot_path = format!("{path}.{snapshot_name}.snap");
        let format = Self::info(path).await?.format;
        let out = process::run(
            RunRequest::new([
                "qemu-img",
                "create",
                "-f",
                &format,
                "-F",
                &format,
                "-b",
                path,
                &snapshot_path,
            ])
            .timeout(QEMU_IMG_TIMEOUT),
        )
        .await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "qemu-img".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        Ok(snapshot_path)
    }

    /// Idempotent: removing an absent file is not an error.
    pub async fn delete(path: &str) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path, "disk: deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_fails_if_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        tokio::fs::write(&path, b"existing").await.unwrap();
        let err = DiskManager::create(path.to_str().unwrap(), 1024, "qcow2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.qcow2");
        DiskManager::delete(path.to_str().unwrap()).await.unwrap();
        DiskManager::delete(path.to_str().unwrap()).await.unwrap();
    }
}
