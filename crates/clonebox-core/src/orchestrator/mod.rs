//! Starts, stops, and reports status for a declared set of VMs with
//! inter-VM dependencies (spec §4.9). Grounded on the continue-past-a-
//! single-failure, per-item isolation shape of `reconciler::reconcile_host`
//! — generalized here from periodic host polling to a one-shot staged
//! dependency plan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clonebox_types::{DomainState, OrchestratedVm, OrchestratorVmState, VmConfig};
use tracing::{error, info, warn};

use crate::cloudinit::CloudInitBuilder;
use crate::disk::DiskManager;
use crate::error::{Error, Result};
use crate::health::{HealthEngine, Scheduler};
use crate::hypervisor::HypervisorBackend;
use crate::secrets::SecretsResolver;
use crate::transaction::Transaction;

const DEFAULT_HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves an `OrchestratedVm::config_source` to a concrete `VmConfig`.
/// An open interface (spec §9) rather than a tagged variant, since the
/// set of sources (file, template registry, remote API) is not closed.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, config_source: &str, environment: &BTreeMap<String, String>) -> Result<VmConfig>;
}

/// Reads `config_source` as a path to a YAML- or JSON-encoded `VmConfig`.
/// Ignores `environment`; a templating resolver can be substituted by
/// implementing `ConfigResolver` directly.
pub struct FileConfigResolver;

#[async_trait]
impl ConfigResolver for FileConfigResolver {
    async fn resolve(&self, config_source: &str, _environment: &BTreeMap<String, String>) -> Result<VmConfig> {
        let content = tokio::fs::read_to_string(config_source).await?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub levels: Vec<Vec<String>>,
}

/// Kahn's-algorithm level computation: groups of VMs with no dependency
/// on one another, safe to start in parallel. Cycles are reported before
/// any action is taken. If `requested` is non-empty the plan is
/// restricted to those VMs plus the transitive closure of their
/// dependencies.
pub fn compute_plan(vms: &[OrchestratedVm], requested: &[String]) -> Result<Plan> {
    let by_name: HashMap<&str, &OrchestratedVm> = vms.iter().map(|vm| (vm.name.as_str(), vm)).collect();

    let scope: HashSet<String> = if requested.is_empty() {
        vms.iter().map(|vm| vm.name.clone()).collect()
    } else {
        let mut scope = HashSet::new();
        let mut stack: Vec<String> = requested.to_vec();
        while let Some(name) = stack.pop() {
            if !scope.insert(name.clone()) {
                continue;
            }
            if let Some(vm) = by_name.get(name.as_str()) {
                stack.extend(vm.depends_on.iter().cloned());
            }
        }
        scope
    };

    let mut in_degree: HashMap<String, usize> = scope.iter().map(|name| (name.clone(), 0)).collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for name in &scope {
        let vm = by_name
            .get(name.as_str())
            .ok_or_else(|| Error::not_found("vm", name.clone()))?;
        for dep in &vm.depends_on {
            if !scope.contains(dep) {
                continue;
            }
            *in_degree.get_mut(name).expect("scope member has an in_degree entry") += 1;
            dependents.entry(dep.clone()).or_default().push(name.clone());
        }
    }

    let mut levels = Vec::new();
    let mut remaining = in_degree;
    let mut processed = 0usize;
    loop {
        let mut ready: Vec<String> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort();
        for name in &ready {
            remaining.remove(name);
        }
        for name in &ready {
            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                    }
                }
            }
        }
        processed += ready.len();
        levels.push(ready);
    }

    if processed != scope.len() {
        return Err(Error::PreconditionFailed(
            "dependency cycle detected in compose document".into(),
        ));
    }
    Ok(Plan { levels })
}

#[derive(Debug, Clone)]
pub struct VmOutcome {
    pub state: OrchestratorVmState,
    pub error: Option<String>,
}

pub struct Orchestrator {
    hypervisor: Arc<dyn HypervisorBackend>,
    secrets: Arc<SecretsResolver>,
    config_resolver: Arc<dyn ConfigResolver>,
    journal_dir: String,
    images_root: String,
}

impl Orchestrator {
    pub fn new(
        hypervisor: Arc<dyn HypervisorBackend>,
        secrets: Arc<SecretsResolver>,
        config_resolver: Arc<dyn ConfigResolver>,
        journal_dir: impl Into<String>,
        images_root: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hypervisor,
            secrets,
            config_resolver,
            journal_dir: journal_dir.into(),
            images_root: images_root.into(),
        })
    }

    /// Starts `vms` level by level; each level's VMs start concurrently in
    /// a worker pool. A VM whose dependency failed is marked `Failed`
    /// without attempting creation — its own dependents are blocked
    /// transitively in turn. Returns a terminal state per VM (spec
    /// invariant 6: a VM at level k starts only after every dependency at
    /// a lower level reaches `running` and, if gated, `healthy`).
    pub async fn up(self: &Arc<Self>, vms: &[OrchestratedVm], requested: &[String]) -> Result<HashMap<String, VmOutcome>> {
        let plan = compute_plan(vms, requested)?;
        let by_name: HashMap<String, OrchestratedVm> =
            vms.iter().cloned().map(|vm| (vm.name.clone(), vm)).collect();

        let mut outcomes: HashMap<String, VmOutcome> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();

        for level in plan.levels {
            let mut handles = Vec::with_capacity(level.len());
            for name in level {
                let Some(vm) = by_name.get(&name).cloned() else { continue };
                if vm.depends_on.iter().any(|dep| failed.contains(dep)) {
                    warn!(vm = %name, "orchestrator: blocked, a dependency failed");
                    outcomes.insert(
                        name.clone(),
                        VmOutcome {
                            state: OrchestratorVmState::Failed,
                            error: Some("blocked: a dependency failed".into()),
                        },
                    );
                    failed.insert(name);
                    continue;
                }
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    let result = this.start_one(&vm).await;
                    (vm.name, result)
                }));
            }
            for handle in futures::future::join_all(handles).await {
                match handle {
                    Ok((name, Ok(()))) => {
                        info!(vm = %name, "orchestrator: vm reached running");
                        outcomes.insert(name, VmOutcome { state: OrchestratorVmState::Running, error: None });
                    }
                    Ok((name, Err(err))) => {
                        error!(vm = %name, error = %err, "orchestrator: vm failed to start");
                        outcomes.insert(
                            name.clone(),
                            VmOutcome { state: OrchestratorVmState::Failed, error: Some(err.to_string()) },
                        );
                        failed.insert(name);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "orchestrator: start task panicked");
                    }
                }
            }
        }
        Ok(outcomes)
    }

    async fn start_one(&self, vm: &OrchestratedVm) -> Result<()> {
        let config = self
            .config_resolver
            .resolve(&vm.config_source, &vm.environment)
            .await?;
        let base_size = DiskManager::info(&config.base_image_path).await?.virtual_size;
        config.validate(base_size).map_err(Error::InvalidArgument)?;

        let vm_dir = format!("{}/{}", self.images_root, config.name);
        let disk_path = format!("{vm_dir}/root.qcow2");
        let serial_log_path = format!("{vm_dir}/serial.log");

        let hypervisor = self.hypervisor.clone();
        let secrets = self.secrets.clone();
        let journal_dir = self.journal_dir.clone();
        let name = config.name.clone();
        let run_hypervisor = hypervisor.clone();

        Transaction::run(&name, &journal_dir, run_hypervisor, move |tx| {
            let config = config.clone();
            let hypervisor = hypervisor.clone();
            let secrets = secrets.clone();
            Box::pin(async move {
                tx.create_directory(&vm_dir).await?;
                tx.create_disk(&disk_path, config.disk_size_bytes, "qcow2", Some(&config.base_image_path))
                    .await?;
                let cloudinit = CloudInitBuilder::new(&secrets).build(&config, &vm_dir).await?;
                tx.register_seed_iso(&cloudinit.seed_iso_path).await?;
                tx.define_domain(
                    hypervisor.as_ref(),
                    &config,
                    &disk_path,
                    &cloudinit.seed_iso_path,
                    &serial_log_path,
                )
                .await?;
                tx.start_domain(hypervisor.as_ref(), &config.name).await?;
                Ok(())
            })
        })
        .await?;

        if let Some(gate) = &vm.health_gate {
            self.wait_for_health_gate(&name, &config, gate).await?;
        }
        Ok(())
    }

    async fn wait_for_health_gate(&self, vm_name: &str, config: &VmConfig, gate: &str) -> Result<()> {
        let gated: Vec<_> = config
            .health_check_configs
            .iter()
            .filter(|check| check.name == gate || check.tags.iter().any(|tag| tag == gate))
            .cloned()
            .collect();
        if gated.is_empty() {
            warn!(vm = vm_name, gate, "orchestrator: health gate names no configured probe, skipping");
            return Ok(());
        }
        let engine = Arc::new(HealthEngine::new(self.hypervisor.clone()));
        let scheduler = Scheduler::start(engine, vm_name.to_string(), gated);
        let reached = scheduler.wait_until_healthy(DEFAULT_HEALTH_GATE_TIMEOUT).await;
        scheduler.stop().await;
        if !reached {
            return Err(Error::Timeout(DEFAULT_HEALTH_GATE_TIMEOUT));
        }
        Ok(())
    }

    /// Strict reverse of the level order; sequential within a level
    /// (shutdown is I/O-light, spec §4.9). Graceful stop first, falling
    /// back to forced stop past `DEFAULT_STOP_TIMEOUT`.
    pub async fn down(&self, vms: &[OrchestratedVm], requested: &[String]) -> Result<HashMap<String, VmOutcome>> {
        let plan = compute_plan(vms, requested)?;
        let mut outcomes = HashMap::new();
        for level in plan.levels.into_iter().rev() {
            for name in level {
                match self.stop_one(&name).await {
                    Ok(()) => {
                        outcomes.insert(name, VmOutcome { state: OrchestratorVmState::Stopped, error: None });
                    }
                    Err(err) => {
                        warn!(vm = %name, error = %err, "orchestrator: failed to stop vm, continuing");
                        outcomes.insert(name, VmOutcome { state: OrchestratorVmState::Failed, error: Some(err.to_string()) });
                    }
                }
            }
        }
        Ok(outcomes)
    }

    async fn stop_one(&self, name: &str) -> Result<()> {
        if !self.hypervisor.exists(name).await? {
            return Ok(());
        }
        let graceful = tokio::time::timeout(DEFAULT_STOP_TIMEOUT, self.hypervisor.stop(name, false)).await;
        match graceful {
            Ok(Ok(())) => Ok(()),
            _ => self.hypervisor.stop(name, true).await,
        }
    }

    /// Read-only snapshot of each named VM's current hypervisor state.
    pub async fn status(&self, vms: &[OrchestratedVm]) -> Result<HashMap<String, OrchestratorVmState>> {
        let mut statuses = HashMap::new();
        for vm in vms {
            let state = match self.hypervisor.info(&vm.name).await? {
                None => OrchestratorVmState::Pending,
                Some(info) if info.state == DomainState::Running => OrchestratorVmState::Running,
                Some(_) => OrchestratorVmState::Stopped,
            };
            statuses.insert(vm.name.clone(), state);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, depends_on: &[&str]) -> OrchestratedVm {
        OrchestratedVm {
            name: name.to_string(),
            config_source: format!("{name}.yaml"),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            health_gate: None,
            environment: BTreeMap::new(),
            state: OrchestratorVmState::Pending,
            error: None,
        }
    }

    #[test]
    fn levels_respect_dependencies() {
        let vms = vec![vm("db", &[]), vm("api", &["db"]), vm("web", &["api"])];
        let plan = compute_plan(&vms, &[]).unwrap();
        assert_eq!(plan.levels, vec![vec!["db".to_string()], vec!["api".to_string()], vec!["web".to_string()]]);
    }

    #[test]
    fn independent_vms_share_a_level() {
        let vms = vec![vm("a", &[]), vm("b", &[])];
        let plan = compute_plan(&vms, &[]).unwrap();
        assert_eq!(plan.levels.len(), 1);
        assert_eq!(plan.levels[0].len(), 2);
    }

    #[test]
    fn cycle_is_rejected_before_any_action() {
        let vms = vec![vm("a", &["b"]), vm("b", &["a"])];
        let err = compute_plan(&vms, &[]).unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[test]
    fn requested_scope_restricts_to_transitive_dependencies() {
        let vms = vec![vm("db", &[]), vm("api", &["db"]), vm("web", &["api"]), vm("unrelated", &[])];
        let plan = compute_plan(&vms, &["api".to_string()]).unwrap();
        let all: Vec<&String> = plan.levels.iter().flatten().collect();
        assert!(all.contains(&&"db".to_string()));
        assert!(all.contains(&&"api".to_string()));
        assert!(!all.contains(&&"web".to_string()));
        assert!(!all.contains(&&"unrelated".to_string()));
    }

    fn test_orchestrator(journal_dir: &std::path::Path, images_root: &std::path::Path) -> Arc<Orchestrator> {
        Orchestrator::new(
            Arc::new(crate::hypervisor::mock::MockBackend::default()),
            Arc::new(crate::secrets::SecretsResolver::new(Vec::new())),
            Arc::new(FileConfigResolver),
            journal_dir.to_string_lossy().to_string(),
            images_root.to_string_lossy().to_string(),
        )
    }

    /// A dependency that fails to resolve (its config file does not
    /// exist) blocks its dependent transitively without attempting it.
    #[tokio::test]
    async fn up_blocks_dependents_of_a_failed_vm() {
        let journal_dir = tempfile::tempdir().unwrap();
        let images_root = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(journal_dir.path(), images_root.path());

        let mut db = vm("db", &[]);
        db.config_source = "/nonexistent/db.yaml".to_string();
        let api = vm("api", &["db"]);

        let outcomes = orchestrator.up(&[db, api], &[]).await.unwrap();

        assert_eq!(outcomes["db"].state, OrchestratorVmState::Failed);
        assert_eq!(outcomes["api"].state, OrchestratorVmState::Failed);
        assert!(outcomes["api"].error.as_deref().unwrap().contains("blocked"));
    }

    /// `down` visits levels in strict reverse order and tolerates a VM
    /// that was never started (`stop_one` is a no-op when absent).
    #[tokio::test]
    async fn down_is_idempotent_for_vms_never_started() {
        let journal_dir = tempfile::tempdir().unwrap();
        let images_root = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(journal_dir.path(), images_root.path());

        let vms = vec![vm("db", &[]), vm("api", &["db"])];
        let outcomes = orchestrator.down(&vms, &[]).await.unwrap();

        assert_eq!(outcomes["db"].state, OrchestratorVmState::Stopped);
        assert_eq!(outcomes["api"].state, OrchestratorVmState::Stopped);
    }
}
