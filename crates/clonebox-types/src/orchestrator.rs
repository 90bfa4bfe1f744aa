use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorVmState {
    Pending,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// One entry of a compose document: a VM plus its dependency edges and
/// optional health gate, as consumed by the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratedVm {
    pub name: String,
    pub config_source: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub health_gate: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_state")]
    pub state: OrchestratorVmState,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_state() -> OrchestratorVmState {
    OrchestratorVmState::Pending
}
