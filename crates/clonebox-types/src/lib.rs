//! Shared wire/data-model types for CloneBox.
//!
//! Mirrors the role `nexus-types` plays for the teacher workspace: plain
//! `serde`-derived structs with no I/O, shared between the core crate and
//! any embedding binary.

mod artifact;
mod health;
mod hypervisor;
mod orchestrator;
mod secrets;
mod snapshot;
mod vm;

pub use artifact::{Artifact, ArtifactKind, TransactionJournal, TransactionState};
pub use health::{HealthCheckConfig, HealthCheckResult, HealthStatus, ProbeType};
pub use hypervisor::{DomainState, VmInfo};
pub use orchestrator::{OrchestratedVm, OrchestratorVmState};
pub use secrets::{Secret, SecretProvider, SecretReference};
pub use snapshot::{Snapshot, SnapshotPolicy, SnapshotState, SnapshotTree, SnapshotType};
pub use vm::{AuthConfig, NetworkMode, PathMount, ResourceLimits, SshKeySource, VmConfig};
