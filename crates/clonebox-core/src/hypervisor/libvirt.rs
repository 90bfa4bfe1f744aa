//! The concrete libvirt/QEMU backend. Grounded on `other_examples`'
//! `LimiQuantix` `libvirt-backend.rs`, which binds the real `virt` crate
//! rather than shelling out to `virsh`.
//!
//! Connection-URI selection (`qemu:///system` vs. `qemu:///session` vs.
//! `qemu+ssh://...`) is configuration of this backend only; nothing above
//! it observes the distinction (spec §9 open question).

use std::time::Duration;

use async_trait::async_trait;
use clonebox_types::{DomainState, VmConfig, VmInfo};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use super::{DomainXmlBuilder, GuestExecResult, HypervisorBackend};
use crate::error::{Error, Result};

pub struct LibvirtBackend {
    uri: String,
    connection: Mutex<Option<Connect>>,
}

// `Connect`/`Domain` wrap a raw libvirt connection pointer; libvirt's C
// API is documented thread-safe per-connection when callers serialize
// access, which the `Mutex` above guarantees.
unsafe impl Send for LibvirtBackend {}
unsafe impl Sync for LibvirtBackend {}

impl LibvirtBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection: Mutex::new(None),
        }
    }

    async fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connect) -> std::result::Result<T, virt::error::Error>,
    ) -> Result<T> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let connect = guard.as_ref().expect("just populated");
        match f(connect) {
            Ok(value) => Ok(value),
            Err(err) => {
                // Single-flight reconnect on a dropped connection, then
                // retry once (spec: "single-shot re-connect").
                warn!(error = %err, "hypervisor: call failed, attempting single reconnect");
                *guard = Some(self.open()?);
                let connect = guard.as_ref().expect("just populated");
                f(connect).map_err(|e| Error::Internal(format!("libvirt: {e}")))
            }
        }
    }

    fn open(&self) -> Result<Connect> {
        Connect::open(Some(&self.uri))
            .map_err(|e| Error::Internal(format!("libvirt connect {}: {e}", self.uri)))
    }

    fn lookup(connect: &Connect, name: &str) -> std::result::Result<Domain, virt::error::Error> {
        Domain::lookup_by_name(connect, name)
    }

    fn state_from_libvirt(state: u32) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_PAUSED => DomainState::Running, // observable but not backend-initiated
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            _ => DomainState::Unknown,
        }
    }

    fn domain_to_info(domain: &Domain) -> std::result::Result<VmInfo, virt::error::Error> {
        let name = domain.get_name()?;
        let uuid = domain.get_uuid_string()?;
        let (state, _reason) = domain.get_state()?;
        let info = domain.get_info()?;
        Ok(VmInfo {
            name,
            uuid,
            state: Self::state_from_libvirt(state),
            vcpus: info.nr_virt_cpu,
            memory_bytes: info.memory * 1024,
            ip_addresses: Vec::new(),
            persistent: domain.is_persistent().unwrap_or(false),
            autostart: domain.get_autostart().unwrap_or(false),
        })
    }
}

#[async_trait]
impl HypervisorBackend for LibvirtBackend {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
            info!(uri = %self.uri, "hypervisor: connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(connect) = guard.take() {
            let _ = connect.close();
        }
        Ok(())
    }

    #[instrument(skip(self, config), fields(vm_name = %config.name))]
    async fn define(
        &self,
        config: &VmConfig,
        disk_path: &str,
        seed_iso_path: &str,
        serial_log_path: &str,
    ) -> Result<String> {
        let xml = DomainXmlBuilder::new(config, disk_path.to_string(), seed_iso_path.to_string())
            .serial_log_path(serial_log_path.to_string())
            .build();
        debug!(xml = %xml, "hypervisor: generated domain xml");

        let name = config.name.clone();
        self.with_connection(move |connect| {
            Domain::define_xml(connect, &xml)?;
            Ok(())
        })
        .await?;
        info!(vm_name = %name, "hypervisor: domain defined");
        Ok(name)
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        let result = self
            .with_connection(move |connect| {
                let domain = Self::lookup(connect, &name)?;
                domain.undefine()
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(_) => Ok(()), // tolerates already-absent domain
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_connection(move |connect| {
            let domain = Self::lookup(connect, &name)?;
            domain.create()?;
            Ok(())
        })
        .await
        .map_err(|_| Error::not_found("domain", name.to_string()))
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let owned = name.to_string();
        self.with_connection(move |connect| {
            let domain = Self::lookup(connect, &owned)?;
            if force {
                domain.destroy()
            } else {
                domain.shutdown()
            }
        })
        .await
        .map_err(|_| Error::not_found("domain", name.to_string()))
    }

    async fn info(&self, name: &str) -> Result<Option<VmInfo>> {
        let owned = name.to_string();
        let result = self
            .with_connection(move |connect| {
                let domain = Self::lookup(connect, &owned)?;
                Self::domain_to_info(&domain)
            })
            .await;
        match result {
            Ok(info) => Ok(Some(info)),
            Err(_) => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        self.with_connection(|connect| {
            let domains = connect.list_all_domains(0)?;
            Ok(domains
                .iter()
                .filter_map(|d| Self::domain_to_info(d).ok())
                .collect())
        })
        .await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.info(name).await?.is_some())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .info(name)
            .await?
            .map(|info| info.state == DomainState::Running)
            .unwrap_or(false))
    }

    /// Submits `guest-exec`, polls `guest-exec-status`, and decodes the
    /// base64 output. Returns `Ok(None)` when the agent channel is
    /// unreachable, per spec's soft-failure contract.
    async fn exec_in_guest(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<Option<GuestExecResult>> {
        let owned = name.to_string();
        let exec_request = serde_json::json!({
            "execute": "guest-exec",
            "arguments": {
                "path": command.first().cloned().unwrap_or_default(),
                "arg": command.get(1..).unwrap_or_default(),
                "capture-output": true,
            }
        })
        .to_string();

        let submit = self
            .with_connection({
                let exec_request = exec_request.clone();
                move |connect| {
                    let domain = Self::lookup(connect, &owned)?;
                    domain.qemu_agent_command(&exec_request, 10, 0)
                }
            })
            .await;
        let Ok(Some(response)) = submit else {
            return Ok(None);
        };
        let Some(pid) = serde_json::from_str::<serde_json::Value>(&response)
            .ok()
            .and_then(|v| v["return"]["pid"].as_i64())
        else {
            return Ok(None);
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let owned = name.to_string();
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let status_request = serde_json::json!({
                "execute": "guest-exec-status",
                "arguments": {"pid": pid},
            })
            .to_string();
            let owned = owned.clone();
            let poll = self
                .with_connection(move |connect| {
                    let domain = Self::lookup(connect, &owned)?;
                    domain.qemu_agent_command(&status_request, 10, 0)
                })
                .await;
            let Ok(Some(response)) = poll else {
                return Ok(None);
            };
            let parsed: serde_json::Value = match serde_json::from_str(&response) {
                Ok(v) => v,
                Err(_) => return Ok(None),
            };
            if parsed["return"]["exited"].as_bool() != Some(true) {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            let exit_code = parsed["return"]["exitcode"].as_i64().map(|c| c as i32);
            let stdout = decode_b64_field(&parsed, "out-data");
            let stderr = decode_b64_field(&parsed, "err-data");
            return Ok(Some(GuestExecResult {
                exit_code,
                stdout,
                stderr,
            }));
        }
    }

    async fn ip_addresses(&self, name: &str) -> Result<Vec<String>> {
        let owned = name.to_string();
        let result = self
            .with_connection(move |connect| {
                let domain = Self::lookup(connect, &owned)?;
                domain.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
            })
            .await;
        match result {
            Ok(interfaces) => Ok(interfaces
                .into_iter()
                .flat_map(|iface| iface.addrs.into_iter().map(|a| a.addr))
                .collect()),
            // falls back to DHCP lease inspection on the managed network,
            // owned by the Network Manager; an empty list here is the
            // signal for the caller to consult it.
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn snapshot_create(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        include_memory: bool,
    ) -> Result<()> {
        let owned = vm_name.to_string();
        let snapshot_name = snapshot_name.to_string();
        let flags = if include_memory {
            0
        } else {
            sys::VIR_DOMAIN_SNAPSHOT_CREATE_DISK_ONLY
        };
        self.with_connection(move |connect| {
            let domain = Self::lookup(connect, &owned)?;
            let xml = format!("<domainsnapshot><name>{snapshot_name}</name></domainsnapshot>");
            domain.snapshot_create_xml(&xml, flags as u32)?;
            Ok(())
        })
        .await
    }

    async fn snapshot_revert(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let owned = vm_name.to_string();
        let snapshot_name = snapshot_name.to_string();
        self.with_connection(move |connect| {
            let domain = Self::lookup(connect, &owned)?;
            let snapshot = domain.snapshot_lookup_by_name(&snapshot_name, 0)?;
            domain.revert_to_snapshot(&snapshot, 0)
        })
        .await
    }

    async fn snapshot_delete(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let owned = vm_name.to_string();
        let snapshot_name = snapshot_name.to_string();
        self.with_connection(move |connect| {
            let domain = Self::lookup(connect, &owned)?;
            let snapshot = domain.snapshot_lookup_by_name(&snapshot_name, 0)?;
            snapshot.delete(0)
        })
        .await
    }
}

fn decode_b64_field(value: &serde_json::Value, field: &str) -> Vec<u8> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    value["return"][field]
        .as_str()
        .and_then(|s| STANDARD.decode(s).ok())
        .unwrap_or_default()
}
