use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    Unknown,
}

/// Typed probe configuration. A closed set switched centrally, per
/// spec.md's preference for a tagged variant over probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeType {
    Tcp {
        host: String,
        port: u16,
    },
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        expected_status: Vec<u16>,
        #[serde(default)]
        expected_body_substring: Option<String>,
        #[serde(default)]
        expected_json_subset: Option<serde_json::Value>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        expected_exit_code: i32,
        #[serde(default)]
        expected_output_substring: Option<String>,
        #[serde(default)]
        run_in_guest: bool,
    },
    Script {
        path: String,
        exit_code: i32,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Disk {
        path: String,
        warn_percent: f64,
        critical_percent: f64,
    },
    Memory {
        warn_percent: f64,
        critical_percent: f64,
    },
    Process {
        pattern: String,
        min_count: u32,
        #[serde(default)]
        max_count: Option<u32>,
    },
    Dns {
        name: String,
        #[serde(default)]
        expected_ip: Option<String>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub name: String,
    pub probe_type: ProbeType,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub on_recovery: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub observed_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
