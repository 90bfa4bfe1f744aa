//! Snapshot creation, restore, deletion, tree assembly, and policy
//! enforcement (spec §4.7). Grounded on the per-object JSON metadata
//! sidecar idiom of `other_examples`' auser-mvm `SnapshotMeta`/`meta.json`
//! (there, one file per base/delta snapshot; here, one file per named
//! snapshot under a per-VM metadata directory) and on the Hypervisor
//! Backend's own `snapshot_create`/`snapshot_revert`/`snapshot_delete` for
//! the actual hypervisor-side operation.
//!
//! Every public entry point takes the per-VM lock once; operations that
//! compose internally (`restore` creating a backup, `enforce_policy`
//! deleting candidates) call the `_inner` variants directly rather than
//! re-entering the public API, since the lock isn't reentrant.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clonebox_types::{Snapshot, SnapshotPolicy, SnapshotState, SnapshotTree, SnapshotType};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hypervisor::HypervisorBackend;

const CURRENT_MARKER_STEM: &str = "_current";

pub struct SnapshotManager<'a> {
    hypervisor: &'a dyn HypervisorBackend,
    metadata_root: PathBuf,
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(hypervisor: &'a dyn HypervisorBackend, state_root: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor,
            metadata_root: state_root.into().join("snapshots"),
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    fn vm_dir(&self, vm_name: &str) -> PathBuf {
        self.metadata_root.join(vm_name)
    }

    fn metadata_path(&self, vm_name: &str, snapshot_name: &str) -> PathBuf {
        self.vm_dir(vm_name).join(format!("{snapshot_name}.json"))
    }

    async fn vm_lock(&self, vm_name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(vm_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn create(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        snapshot_type: SnapshotType,
        description: Option<String>,
        tags: Vec<String>,
        auto_policy: Option<String>,
    ) -> Result<Snapshot> {
        let lock = self.vm_lock(vm_name).await;
        let _guard = lock.lock().await;
        self.create_inner(vm_name, snapshot_name, snapshot_type, description, tags, auto_policy)
            .await
    }

    async fn create_inner(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        snapshot_type: SnapshotType,
        description: Option<String>,
        tags: Vec<String>,
        auto_policy: Option<String>,
    ) -> Result<Snapshot> {
        if self.metadata_path(vm_name, snapshot_name).exists() {
            return Err(Error::already_exists("snapshot", snapshot_name));
        }
        if snapshot_type == SnapshotType::FullWithMemory && !self.hypervisor.is_running(vm_name).await? {
            return Err(Error::PreconditionFailed(format!(
                "{vm_name} must be running for a full_with_memory snapshot"
            )));
        }

        let parent_name = self.current_name(vm_name).await?;

        self.hypervisor
            .snapshot_create(vm_name, snapshot_name, snapshot_type == SnapshotType::FullWithMemory)
            .await?;

        let snapshot = Snapshot {
            name: snapshot_name.to_string(),
            vm_name: vm_name.to_string(),
            snapshot_type,
            state: SnapshotState::Ready,
            created_at: Utc::now(),
            description,
            parent_name: parent_name.clone(),
            children: Vec::new(),
            size_bytes: 0,
            tags,
            auto_policy,
            expires_at: None,
        };
        self.write_metadata(&snapshot).await?;

        if let Some(parent) = parent_name {
            if let Some(mut parent_snapshot) = self.read_metadata(vm_name, &parent).await? {
                parent_snapshot.children.push(snapshot_name.to_string());
                self.write_metadata(&parent_snapshot).await?;
            }
        }
        self.set_current_name(vm_name, snapshot_name).await?;

        info!(vm_name, snapshot_name, "snapshot: created");
        Ok(snapshot)
    }

    /// Reconciles hypervisor-reported snapshots with the metadata
    /// side-table; a hypervisor snapshot with no sidecar file gets a
    /// synthesized record with default fields. Sorted newest first.
    pub async fn list(&self, vm_name: &str) -> Result<Vec<Snapshot>> {
        let mut by_name: HashMap<String, Snapshot> = HashMap::new();

        if let Ok(mut entries) = tokio::fs::read_dir(self.vm_dir(vm_name)).await {
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_marker = path.file_stem().and_then(|s| s.to_str()) == Some(CURRENT_MARKER_STEM);
                if path.extension().and_then(|e| e.to_str()) != Some("json") || is_marker {
                    continue;
                }
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&bytes) {
                        by_name.insert(snapshot.name.clone(), snapshot);
                    }
                }
            }
        }

        let mut snapshots: Vec<Snapshot> = by_name.into_values().collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Single-pass parent→children derivation over the current metadata
    /// set; no pointer cycles, just flat records plus a name index.
    pub async fn tree(&self, vm_name: &str) -> Result<SnapshotTree> {
        let snapshots = self.list(vm_name).await?;
        let root_names = snapshots
            .iter()
            .filter(|s| s.parent_name.is_none())
            .map(|s| s.name.clone())
            .collect();
        Ok(SnapshotTree {
            vm_name: vm_name.to_string(),
            root_names,
            current_name: self.current_name(vm_name).await?,
        })
    }

    pub async fn restore(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        start_after: bool,
        create_backup: bool,
    ) -> Result<()> {
        let lock = self.vm_lock(vm_name).await;
        let _guard = lock.lock().await;

        if self.read_metadata(vm_name, snapshot_name).await?.is_none() {
            return Err(Error::not_found("snapshot", snapshot_name));
        }

        if create_backup {
            let backup_name = format!("pre-restore-{}", Utc::now().format("%Y%m%d%H%M%S"));
            self.create_inner(
                vm_name,
                &backup_name,
                SnapshotType::DiskOnly,
                Some(format!("automatic backup before restoring {snapshot_name}")),
                vec!["pre-restore".to_string()],
                None,
            )
            .await
            .map_err(|e| {
                Error::PreconditionFailed(format!("restore aborted: backup creation failed: {e}"))
            })?;
        }

        self.hypervisor.stop(vm_name, true).await?;

        if let Err(revert_err) = self.hypervisor.snapshot_revert(vm_name, snapshot_name).await {
            warn!(
                vm_name,
                snapshot_name,
                error = %revert_err,
                "snapshot: revert failed after backup, backup is retained"
            );
            return Err(revert_err);
        }

        self.set_current_name(vm_name, snapshot_name).await?;
        if start_after {
            self.hypervisor.start(vm_name).await?;
        }
        info!(vm_name, snapshot_name, start_after, "snapshot: restored");
        Ok(())
    }

    /// Non-recursive delete fails if `snapshot_name` has children.
    /// Recursive delete visits descendants before the node itself
    /// (post-order), collected iteratively to avoid recursive `async fn`.
    pub async fn delete(&self, vm_name: &str, snapshot_name: &str, recursive: bool) -> Result<()> {
        let lock = self.vm_lock(vm_name).await;
        let _guard = lock.lock().await;
        self.delete_inner(vm_name, snapshot_name, recursive).await
    }

    async fn delete_inner(&self, vm_name: &str, snapshot_name: &str, recursive: bool) -> Result<()> {
        let Some(root) = self.read_metadata(vm_name, snapshot_name).await? else {
            return Err(Error::not_found("snapshot", snapshot_name));
        };
        if !root.children.is_empty() && !recursive {
            return Err(Error::PreconditionFailed(format!(
                "{snapshot_name} has {} child snapshot(s); use recursive delete",
                root.children.len()
            )));
        }

        let mut pre_order = Vec::new();
        let mut stack = vec![snapshot_name.to_string()];
        while let Some(name) = stack.pop() {
            if let Some(meta) = self.read_metadata(vm_name, &name).await? {
                stack.extend(meta.children.clone());
            }
            pre_order.push(name);
        }

        for name in pre_order.into_iter().rev() {
            self.delete_single(vm_name, &name).await?;
        }
        info!(vm_name, snapshot_name, recursive, "snapshot: deleted");
        Ok(())
    }

    async fn delete_single(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let Some(snapshot) = self.read_metadata(vm_name, snapshot_name).await? else {
            return Ok(());
        };

        self.hypervisor.snapshot_delete(vm_name, snapshot_name).await?;
        let _ = tokio::fs::remove_file(self.metadata_path(vm_name, snapshot_name)).await;

        if let Some(parent_name) = &snapshot.parent_name {
            if let Some(mut parent) = self.read_metadata(vm_name, parent_name).await? {
                parent.children.retain(|c| c != snapshot_name);
                self.write_metadata(&parent).await?;
            }
        }
        Ok(())
    }

    /// Ordered sweep: expired first, then over-count, then over-size.
    /// Only snapshots tagged with `policy.name` participate.
    pub async fn enforce_policy(&self, vm_name: &str, policy: &SnapshotPolicy) -> Result<usize> {
        let lock = self.vm_lock(vm_name).await;
        let _guard = lock.lock().await;

        let mut deleted = 0;
        let now = Utc::now();

        let mut candidates: Vec<Snapshot> = self
            .list(vm_name)
            .await?
            .into_iter()
            .filter(|s| s.auto_policy.as_deref() == Some(policy.name.as_str()))
            .collect();

        let expired: Vec<String> = candidates
            .iter()
            .filter(|s| s.expires_at.map(|e| e < now).unwrap_or(false))
            .map(|s| s.name.clone())
            .collect();
        for name in expired {
            let _ = self.delete_inner(vm_name, &name, false).await;
            candidates.retain(|s| s.name != name);
            deleted += 1;
        }

        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(max_count) = policy.max_count {
            while candidates.len() as u32 > max_count {
                let oldest = candidates.remove(0);
                let _ = self.delete_inner(vm_name, &oldest.name, false).await;
                deleted += 1;
            }
        }
        if let Some(max_size_bytes) = policy.max_size_bytes {
            while !candidates.is_empty()
                && candidates.iter().map(|s| s.size_bytes).sum::<u64>() > max_size_bytes
            {
                let oldest = candidates.remove(0);
                let _ = self.delete_inner(vm_name, &oldest.name, false).await;
                deleted += 1;
            }
        }

        info!(vm_name, policy = policy.name, deleted, "snapshot: policy enforced");
        Ok(deleted)
    }

    async fn current_name(&self, vm_name: &str) -> Result<Option<String>> {
        let marker = self.vm_dir(vm_name).join(format!("{CURRENT_MARKER_STEM}.json"));
        match tokio::fs::read_to_string(&marker).await {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set_current_name(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let marker = self.vm_dir(vm_name).join(format!("{CURRENT_MARKER_STEM}.json"));
        tokio::fs::create_dir_all(self.vm_dir(vm_name)).await?;
        tokio::fs::write(&marker, snapshot_name).await?;
        Ok(())
    }

    async fn read_metadata(&self, vm_name: &str, snapshot_name: &str) -> Result<Option<Snapshot>> {
        match tokio::fs::read(self.metadata_path(vm_name, snapshot_name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_metadata(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.vm_dir(&snapshot.vm_name);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(self.metadata_path(&snapshot.vm_name, &snapshot.name), bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockBackend;
    use clonebox_types::VmConfig;

    fn vm_config(name: &str) -> VmConfig {
        VmConfig {
            name: name.to_string(),
            vcpus: 1,
            memory_bytes: 512 * 1024 * 1024,
            disk_size_bytes: 1024 * 1024 * 1024,
            base_image_path: "/tmp/base.qcow2".into(),
            network_mode: clonebox_types::NetworkMode::UserMode,
            username: "dev".into(),
            auth_config: clonebox_types::AuthConfig::SshKey {
                sources: vec![clonebox_types::SshKeySource::Literal { key: "ssh-ed25519 AAAA".into() }],
            },
            packages: Default::default(),
            services: Default::default(),
            path_mounts: Vec::new(),
            post_commands: Vec::new(),
            resource_limits: None,
            health_check_configs: Vec::new(),
            snapshot_policy: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::default();
        backend.define(&vm_config("dev"), "/tmp/disk.qcow2", "/tmp/seed.iso", "/tmp/serial.log").await.unwrap();
        let manager = SnapshotManager::new(&backend, dir.path());

        manager
            .create("dev", "snap1", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();
        let err = manager
            .create("dev", "snap1", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_non_recursive_rejects_when_children_exist() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::default();
        backend.define(&vm_config("dev"), "/tmp/disk.qcow2", "/tmp/seed.iso", "/tmp/serial.log").await.unwrap();
        let manager = SnapshotManager::new(&backend, dir.path());

        manager
            .create("dev", "root", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();
        manager
            .create("dev", "child", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();

        let err = manager.delete("dev", "root", false).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn tree_derives_root_from_parentless_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::default();
        backend.define(&vm_config("dev"), "/tmp/disk.qcow2", "/tmp/seed.iso", "/tmp/serial.log").await.unwrap();
        let manager = SnapshotManager::new(&backend, dir.path());

        manager
            .create("dev", "root", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();
        manager
            .create("dev", "child", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();

        let tree = manager.tree("dev").await.unwrap();
        assert_eq!(tree.root_names, vec!["root".to_string()]);
        assert_eq!(tree.current_name, Some("child".to_string()));
    }

    #[tokio::test]
    async fn restore_rejects_unknown_snapshot_name() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::default();
        backend.define(&vm_config("dev"), "/tmp/disk.qcow2", "/tmp/seed.iso", "/tmp/serial.log").await.unwrap();
        let manager = SnapshotManager::new(&backend, dir.path());

        manager
            .create("dev", "root", SnapshotType::DiskOnly, None, vec![], None)
            .await
            .unwrap();

        let err = manager
            .restore("dev", "nonexistent-snapshot", false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
