//! Minimal demonstration entry point: reads a `VmConfig` from the JSON
//! file named in `argv[1]` and drives one create / up / down cycle
//! through a `Builder::default()` container. The real CLI parser and any
//! interactive surface are out of scope here.

use clonebox_core::container::{init_logging, Builder};
use clonebox_types::{OrchestratedVm, OrchestratorVmState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: clonebox <vm-config.json>"))?;
    let config_text = tokio::fs::read_to_string(&config_path).await?;
    let name: String = serde_json::from_str::<serde_json::Value>(&config_text)?
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("vm config is missing a `name` field"))?
        .to_string();

    let builder = Builder::default();
    let orchestrator = builder.orchestrator;

    let vm = OrchestratedVm {
        name: name.clone(),
        config_source: config_path,
        depends_on: Vec::new(),
        health_gate: None,
        environment: Default::default(),
        state: OrchestratorVmState::Pending,
        error: None,
    };

    info!(vm = %name, "bringing vm up");
    let up_outcomes = orchestrator.up(&[vm.clone()], &[]).await?;
    for (vm_name, outcome) in &up_outcomes {
        info!(vm = %vm_name, state = ?outcome.state, error = ?outcome.error, "up outcome");
    }

    info!(vm = %name, "tearing vm down");
    let down_outcomes = orchestrator.down(&[vm], &[]).await?;
    for (vm_name, outcome) in &down_outcomes {
        info!(vm = %vm_name, state = ?outcome.state, error = ?outcome.error, "down outcome");
    }

    Ok(())
}
