//! The polymorphic abstraction over the virtualization layer (spec
//! §4.3). `libvirt`/QEMU is one backend behind this trait; spec §9
//! prefers an open interface here (vs. a tagged variant) so a future
//! non-libvirt implementation can be added without touching callers.

pub mod libvirt;
pub mod mock;
mod xml;

use std::time::Duration;

use async_trait::async_trait;
use clonebox_types::VmConfig;
pub use clonebox_types::{DomainState, VmInfo};

pub use libvirt::LibvirtBackend;
pub use xml::DomainXmlBuilder;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct GuestExecResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// `disk_path`/`seed_iso_path` are the actual paths the Disk Manager
    /// and Cloud-Init Builder wrote to — the backend must not re-derive
    /// them, since the caller's `images_root` is configurable.
    async fn define(
        &self,
        config: &VmConfig,
        disk_path: &str,
        seed_iso_path: &str,
        serial_log_path: &str,
    ) -> Result<String>;
    async fn undefine(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str, force: bool) -> Result<()>;

    async fn info(&self, name: &str) -> Result<Option<VmInfo>>;
    async fn list(&self) -> Result<Vec<VmInfo>>;
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Executes a command through the guest-agent channel
    /// (`org.qemu.guest_agent.0`). Returns `Ok(None)` — not an error —
    /// when the agent is unreachable (spec: soft failure).
    async fn exec_in_guest(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<Option<GuestExecResult>>;

    async fn ip_addresses(&self, name: &str) -> Result<Vec<String>>;

    /// Snapshot operations delegate to the backend because internal
    /// (qcow2-embedded) snapshots are a hypervisor-domain concept; the
    /// Snapshot Manager (spec §4.7) is the only caller.
    async fn snapshot_create(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        include_memory: bool,
    ) -> Result<()>;
    async fn snapshot_revert(&self, vm_name: &str, snapshot_name: &str) -> Result<()>;
    async fn snapshot_delete(&self, vm_name: &str, snapshot_name: &str) -> Result<()>;
}
