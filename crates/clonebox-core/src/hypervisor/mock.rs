//! An in-memory `HypervisorBackend` used by tests that must not depend on
//! a live libvirt daemon (the Snapshot/Transaction/Health/Orchestrator
//! test suites).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use clonebox_types::{DomainState, VmConfig, VmInfo};

use super::{GuestExecResult, HypervisorBackend};
use crate::error::{Error, Result};

#[derive(Clone)]
struct MockDomain {
    info: VmInfo,
    snapshots: Vec<String>,
}

pub struct MockBackend {
    domains: Mutex<HashMap<String, MockDomain>>,
    pub fail_define: Mutex<bool>,
    pub guest_agent_reachable: Mutex<bool>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            fail_define: Mutex::new(false),
            guest_agent_reachable: Mutex::new(true),
        }
    }
}

impl MockBackend {
    pub fn set_fail_define(&self, fail: bool) {
        *self.fail_define.lock().unwrap() = fail;
    }

    pub fn set_guest_agent_reachable(&self, reachable: bool) {
        *self.guest_agent_reachable.lock().unwrap() = reachable;
    }
}

#[async_trait]
impl HypervisorBackend for MockBackend {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn define(
        &self,
        config: &VmConfig,
        _disk_path: &str,
        _seed_iso_path: &str,
        _serial_log_path: &str,
    ) -> Result<String> {
        if *self.fail_define.lock().unwrap() {
            return Err(Error::Internal("forced define failure".into()));
        }
        let mut domains = self.domains.lock().unwrap();
        if domains.contains_key(&config.name) {
            return Err(Error::already_exists("domain", config.name.clone()));
        }
        domains.insert(
            config.name.clone(),
            MockDomain {
                info: VmInfo {
                    name: config.name.clone(),
                    uuid: uuid::Uuid::new_v4().to_string(),
                    state: DomainState::Shutoff,
                    vcpus: config.vcpus,
                    memory_bytes: config.memory_bytes,
                    ip_addresses: vec![],
                    persistent: true,
                    autostart: false,
                },
                snapshots: Vec::new(),
            },
        );
        Ok(config.name.clone())
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        self.domains.lock().unwrap().remove(name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| Error::not_found("domain", name))?;
        domain.info.state = DomainState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str, _force: bool) -> Result<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| Error::not_found("domain", name))?;
        domain.info.state = DomainState::Shutoff;
        Ok(())
    }

    async fn info(&self, name: &str) -> Result<Option<VmInfo>> {
        Ok(self.domains.lock().unwrap().get(name).map(|d| d.info.clone()))
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .values()
            .map(|d| d.info.clone())
            .collect())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains.lock().unwrap().contains_key(name))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .get(name)
            .map(|d| d.info.state == DomainState::Running)
            .unwrap_or(false))
    }

    async fn exec_in_guest(
        &self,
        _name: &str,
        _command: &[String],
        _timeout: Duration,
    ) -> Result<Option<GuestExecResult>> {
        if !*self.guest_agent_reachable.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(GuestExecResult {
            exit_code: Some(0),
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
        }))
    }

    async fn ip_addresses(&self, _name: &str) -> Result<Vec<String>> {
        Ok(vec!["192.0.2.10".to_string()])
    }

    async fn snapshot_create(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        _include_memory: bool,
    ) -> Result<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(vm_name)
            .ok_or_else(|| Error::not_found("domain", vm_name))?;
        domain.snapshots.push(snapshot_name.to_string());
        Ok(())
    }

    async fn snapshot_revert(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let domains = self.domains.lock().unwrap();
        let domain = domains
            .get(vm_name)
            .ok_or_else(|| Error::not_found("domain", vm_name))?;
        if !domain.snapshots.contains(&snapshot_name.to_string()) {
            return Err(Error::not_found("snapshot", snapshot_name));
        }
        Ok(())
    }

    async fn snapshot_delete(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(vm_name)
            .ok_or_else(|| Error::not_found("domain", vm_name))?;
        domain.snapshots.retain(|s| s != snapshot_name);
        Ok(())
    }
}
