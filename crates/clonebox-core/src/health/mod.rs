//! Evaluates typed probes, maintains a per-probe state machine, and runs
//! the recurring scheduler that dispatches `on_failure`/`on_recovery`
//! actions on transitions (spec §4.8).

mod probes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clonebox_types::{HealthCheckConfig, HealthCheckResult, HealthStatus};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::hypervisor::HypervisorBackend;
use crate::process::{self, RunRequest};

#[derive(Debug, Clone)]
struct ProbeState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    status: HealthStatus,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: HealthStatus::Unknown,
        }
    }
}

/// Per-VM aggregation (spec §4.8): `unhealthy` if any `critical` probe is
/// `unhealthy`; else `degraded` if any probe is unhealthy or degraded;
/// else `healthy` if every probe is healthy; else `unknown`.
pub fn aggregate(probes: &[(bool, HealthStatus)]) -> HealthStatus {
    if probes.is_empty() {
        return HealthStatus::Unknown;
    }
    if probes.iter().any(|(critical, status)| *critical && *status == HealthStatus::Unhealthy) {
        return HealthStatus::Unhealthy;
    }
    if probes
        .iter()
        .any(|(_, status)| matches!(status, HealthStatus::Unhealthy | HealthStatus::Degraded))
    {
        return HealthStatus::Degraded;
    }
    if probes.iter().all(|(_, status)| *status == HealthStatus::Healthy) {
        return HealthStatus::Healthy;
    }
    HealthStatus::Unknown
}

pub struct HealthEngine {
    hypervisor: Arc<dyn HypervisorBackend>,
}

impl HealthEngine {
    pub fn new(hypervisor: Arc<dyn HypervisorBackend>) -> Self {
        Self { hypervisor }
    }

    /// Runs one probe invocation, advances the consecutive-failure /
    /// consecutive-success state machine in place, and dispatches the
    /// transition action (if any). Invariant: one of the two counters is
    /// always zero (spec invariant 4).
    async fn check_once(&self, vm_name: &str, config: &HealthCheckConfig, state: &mut ProbeState) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let was_healthy = state.status == HealthStatus::Healthy;

        let outcome = tokio::time::timeout(
            config.timeout,
            probes::execute(self.hypervisor.as_ref(), vm_name, &config.probe_type, config.timeout),
        )
        .await;

        let (observed, message, details) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => (HealthStatus::Unknown, e.to_string(), serde_json::Value::Null),
            Err(_) => (HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null),
        };

        if observed == HealthStatus::Healthy {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        }

        let declared = if state.consecutive_failures >= config.failure_threshold {
            HealthStatus::Unhealthy
        } else if state.consecutive_failures > 0 {
            HealthStatus::Degraded
        } else if state.consecutive_successes >= config.success_threshold {
            HealthStatus::Healthy
        } else {
            state.status
        };
        state.status = declared;

        let is_healthy_now = declared == HealthStatus::Healthy;
        if was_healthy && !is_healthy_now {
            self.dispatch_action(vm_name, config, config.on_failure.as_deref(), "on_failure").await;
        } else if !was_healthy && is_healthy_now {
            self.dispatch_action(vm_name, config, config.on_recovery.as_deref(), "on_recovery").await;
        }

        HealthCheckResult {
            name: config.name.clone(),
            status: declared,
            observed_at: chrono::Utc::now(),
            duration: start.elapsed(),
            message,
            details,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
        }
    }

    /// Action dispatch failures are logged and never mask the declared
    /// status (spec §4.8, §7).
    async fn dispatch_action(&self, vm_name: &str, config: &HealthCheckConfig, command: Option<&str>, kind: &str) {
        let Some(command) = command else { return };
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let probe = config.name.as_str();
        match process::run(RunRequest::new(argv).timeout(Duration::from_secs(30))).await {
            Ok(out) if out.success() => {
                info!(vm_name, probe, action = kind, "health: action dispatched");
            }
            Ok(out) => {
                warn!(vm_name, probe, action = kind, exit_code = ?out.exit_code, "health: action exited non-zero");
            }
            Err(e) => {
                warn!(vm_name, probe, action = kind, error = %e, "health: action dispatch failed");
            }
        }
    }
}

/// Runs one cooperative task per configured probe: `check -> sleep(interval)`
/// until cancelled. Cancellation is delivered through a `watch` channel so
/// it preempts an in-progress sleep immediately, regardless of interval
/// length (spec: cancellation fires within `max(timeout, 2s)`).
pub struct Scheduler {
    cancel_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
    critical: Arc<HashMap<String, bool>>,
}

impl Scheduler {
    pub fn start(engine: Arc<HealthEngine>, vm_name: String, configs: Vec<HealthCheckConfig>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let results: Arc<RwLock<HashMap<String, HealthCheckResult>>> = Arc::new(RwLock::new(HashMap::new()));
        let critical: Arc<HashMap<String, bool>> = Arc::new(
            configs
                .iter()
                .map(|config| (config.name.clone(), config.critical))
                .collect(),
        );

        let mut handles = Vec::with_capacity(configs.len());
        for config in configs {
            let engine = engine.clone();
            let vm_name = vm_name.clone();
            let results = results.clone();
            let mut cancel_rx = cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut state = ProbeState::default();
                loop {
                    let result = engine.check_once(&vm_name, &config, &mut state).await;
                    results.write().await.insert(config.name.clone(), result);
                    if *cancel_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.interval) => {}
                        _ = cancel_rx.changed() => break,
                    }
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }));
        }

        Self { cancel_tx, handles, results, critical }
    }

    pub async fn status(&self) -> HealthStatus {
        let results = self.results.read().await;
        let pairs: Vec<(bool, HealthStatus)> = results
            .iter()
            .map(|(name, result)| (*self.critical.get(name).unwrap_or(&false), result.status))
            .collect();
        aggregate(&pairs)
    }

    pub async fn results(&self) -> Vec<HealthCheckResult> {
        self.results.read().await.values().cloned().collect()
    }

    /// Polls `status()` until it reports `healthy` or `timeout` elapses.
    /// Used by the Orchestrator's health gate.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().await == HealthStatus::Healthy {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Signals every per-probe task to stop and waits for them to exit.
    pub async fn stop(self) {
        let _ = self.cancel_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonebox_types::ProbeType;

    fn config(name: &str, probe_type: ProbeType) -> HealthCheckConfig {
        HealthCheckConfig {
            name: name.to_string(),
            probe_type,
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
            failure_threshold: 2,
            success_threshold: 1,
            on_failure: None,
            on_recovery: None,
            critical: false,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn tcp_probe_against_closed_port_degrades_before_threshold() {
        let engine = HealthEngine::new(Arc::new(crate::hypervisor::mock::MockBackend::default()));
        let mut state = ProbeState::default();
        let cfg = config("port-check", ProbeType::Tcp { host: "127.0.0.1".into(), port: 1 });
        let result = engine.check_once("vm", &cfg, &mut state).await;
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(result.consecutive_failures, 1);
        assert_eq!(result.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn counters_are_mutually_exclusive_across_transitions() {
        let engine = HealthEngine::new(Arc::new(crate::hypervisor::mock::MockBackend::default()));
        let mut state = ProbeState::default();
        let cfg = config("cmd", ProbeType::Command {
            program: "false".into(),
            args: Vec::new(),
            expected_exit_code: 0,
            expected_output_substring: None,
            run_in_guest: false,
        });
        for _ in 0..3 {
            let result = engine.check_once("vm", &cfg, &mut state).await;
            assert!(result.consecutive_failures == 0 || result.consecutive_successes == 0);
        }
        assert_eq!(state.consecutive_successes, 0);
        assert!(state.consecutive_failures >= 2);
        assert_eq!(state.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn aggregate_prioritizes_critical_unhealthy() {
        let probes = vec![(true, HealthStatus::Unhealthy), (false, HealthStatus::Healthy)];
        assert_eq!(aggregate(&probes), HealthStatus::Unhealthy);
    }

    #[test]
    fn aggregate_is_degraded_on_noncritical_unhealthy() {
        let probes = vec![(false, HealthStatus::Unhealthy), (false, HealthStatus::Healthy)];
        assert_eq!(aggregate(&probes), HealthStatus::Degraded);
    }

    #[test]
    fn aggregate_is_healthy_when_all_healthy() {
        let probes = vec![(true, HealthStatus::Healthy), (false, HealthStatus::Healthy)];
        assert_eq!(aggregate(&probes), HealthStatus::Healthy);
    }

    #[test]
    fn aggregate_is_unknown_with_no_probes() {
        assert_eq!(aggregate(&[]), HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn scheduler_runs_probe_and_stops_on_cancel() {
        let engine = Arc::new(HealthEngine::new(Arc::new(crate::hypervisor::mock::MockBackend::default())));
        let cfg = config("always-ok", ProbeType::Command {
            program: "true".into(),
            args: Vec::new(),
            expected_exit_code: 0,
            expected_output_substring: None,
            run_in_guest: false,
        });
        let scheduler = Scheduler::start(engine, "vm".to_string(), vec![cfg]);
        assert!(scheduler.wait_until_healthy(Duration::from_secs(2)).await);
        scheduler.stop().await;
    }
}
