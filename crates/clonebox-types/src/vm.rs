use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::health::HealthCheckConfig;
use crate::secrets::SecretReference;
use crate::snapshot::SnapshotPolicy;

/// User-facing input to VM provisioning. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// DNS-safe identifier, unique per host. Must match `[a-z][a-z0-9-]{0,62}`.
    pub name: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub disk_size_bytes: u64,
    pub base_image_path: String,
    pub network_mode: NetworkMode,
    pub username: String,
    pub auth_config: AuthConfig,
    #[serde(default)]
    pub packages: BTreeSet<String>,
    #[serde(default)]
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub path_mounts: Vec<PathMount>,
    #[serde(default)]
    pub post_commands: Vec<String>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub health_check_configs: Vec<HealthCheckConfig>,
    #[serde(default)]
    pub snapshot_policy: Option<SnapshotPolicy>,
}

impl VmConfig {
    /// Validates the invariants spec.md §3 places on `VmConfig` without
    /// performing any side effect. Called before any filesystem or
    /// hypervisor operation is attempted.
    pub fn validate(&self, base_image_size: u64) -> Result<(), String> {
        if !is_dns_safe_name(&self.name) {
            return Err(format!(
                "name {:?} does not match [a-z][a-z0-9-]{{0,62}}",
                self.name
            ));
        }
        if self.vcpus == 0 {
            return Err("vcpus must be positive".into());
        }
        if self.memory_bytes == 0 {
            return Err("memory_bytes must be positive".into());
        }
        if self.disk_size_bytes < base_image_size {
            return Err(format!(
                "disk_size_bytes ({}) must be >= base_image_size ({})",
                self.disk_size_bytes, base_image_size
            ));
        }
        if let AuthConfig::SshKey { sources } = &self.auth_config {
            if sources.is_empty() {
                return Err("ssh_key auth requires at least one source".into());
            }
        }
        Ok(())
    }
}

fn is_dns_safe_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    let rest_len = name.len() - 1;
    if rest_len > 62 {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    Auto,
    UserMode,
    DefaultBridge,
    CustomBridge,
}

/// Tagged variant over the supported authentication materialization
/// strategies. `Password` is deprecated; resolving it emits a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthConfig {
    SshKey { sources: Vec<SshKeySource> },
    OneTimePassword { length: usize },
    Password { secret_reference: SecretReference },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SshKeySource {
    FilePath { path: String },
    GitHub { user: String },
    GitLab { user: String, host: String },
    Literal { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMount {
    pub host_path: String,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_shares: Option<u32>,
    #[serde(default)]
    pub cpu_quota_us: Option<u64>,
    #[serde(default)]
    pub cpu_period_us: Option<u64>,
    #[serde(default)]
    pub memory_hard_bytes: Option<u64>,
    #[serde(default)]
    pub memory_soft_bytes: Option<u64>,
    #[serde(default)]
    pub memory_swap_bytes: Option<u64>,
    #[serde(default)]
    pub block_io_bps: Option<u64>,
    #[serde(default)]
    pub block_io_iops: Option<u64>,
    #[serde(default)]
    pub network_rate_bps: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_safe_names() {
        assert!(is_dns_safe_name("dev"));
        assert!(is_dns_safe_name("web-01"));
        assert!(!is_dns_safe_name("Dev"));
        assert!(!is_dns_safe_name("0dev"));
        assert!(!is_dns_safe_name(""));
        assert!(!is_dns_safe_name(&"a".repeat(64)));
    }
}
