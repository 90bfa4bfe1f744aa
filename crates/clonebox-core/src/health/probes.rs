//! Per-`ProbeType` execution (spec §4.8). Guest-targeted checks go
//! through `HypervisorBackend::exec_in_guest`; host-targeted checks run
//! through the Process Runner or a direct syscall.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use clonebox_types::{HealthStatus, ProbeType};
use serde_json::json;

use crate::error::{Error, Result};
use crate::hypervisor::HypervisorBackend;
use crate::process::{self, RunRequest};

pub async fn execute(
    hypervisor: &dyn HypervisorBackend,
    vm_name: &str,
    probe: &ProbeType,
    timeout: Duration,
) -> Result<(HealthStatus, String, serde_json::Value)> {
    match probe {
        ProbeType::Tcp { host, port } => tcp(host, *port, timeout).await,
        ProbeType::Http {
            url,
            method,
            expected_status,
            expected_body_substring,
            expected_json_subset,
            headers,
        } => {
            http(
                url,
                method,
                expected_status,
                expected_body_substring.as_deref(),
                expected_json_subset.as_ref(),
                headers,
                timeout,
            )
            .await
        }
        ProbeType::Command {
            program,
            args,
            expected_exit_code,
            expected_output_substring,
            run_in_guest,
        } => {
            command(
                hypervisor,
                vm_name,
                program,
                args,
                *expected_exit_code,
                expected_output_substring.as_deref(),
                *run_in_guest,
                timeout,
            )
            .await
        }
        ProbeType::Script { path, exit_code, env } => script(path, *exit_code, env, timeout).await,
        ProbeType::Disk { path, warn_percent, critical_percent } => {
            disk(path, *warn_percent, *critical_percent).await
        }
        ProbeType::Memory { warn_percent, critical_percent } => {
            memory(*warn_percent, *critical_percent).await
        }
        ProbeType::Process { pattern, min_count, max_count } => {
            process_count(pattern, *min_count, *max_count, timeout).await
        }
        ProbeType::Dns { name, expected_ip } => dns(name, expected_ip.as_deref(), timeout).await,
    }
}

async fn tcp(host: &str, port: u16, timeout: Duration) -> Result<(HealthStatus, String, serde_json::Value)> {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok((HealthStatus::Healthy, format!("connected to {addr}"), serde_json::Value::Null)),
        Ok(Err(e)) => Ok((HealthStatus::Unhealthy, e.to_string(), serde_json::Value::Null)),
        Err(_) => Ok((HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null)),
    }
}

async fn http(
    url: &str,
    method: &str,
    expected_status: &[u16],
    expected_body_substring: Option<&str>,
    expected_json_subset: Option<&serde_json::Value>,
    headers: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<(HealthStatus, String, serde_json::Value)> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(Error::Http)?;
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut request = client.request(method, url);
    for (key, value) in headers {
        request = request.header(key, value);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return Ok((HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null))
        }
        Err(e) => return Ok((HealthStatus::Unhealthy, e.to_string(), serde_json::Value::Null)),
    };

    let status = response.status().as_u16();
    if !expected_status.is_empty() && !expected_status.contains(&status) {
        return Ok((
            HealthStatus::Unhealthy,
            format!("status {status} not in {expected_status:?}"),
            json!({"status": status}),
        ));
    }

    let body = response.text().await.unwrap_or_default();
    if let Some(substring) = expected_body_substring {
        if !body.contains(substring) {
            return Ok((
                HealthStatus::Unhealthy,
                format!("body missing substring {substring:?}"),
                json!({"status": status}),
            ));
        }
    }
    if let Some(subset) = expected_json_subset {
        let matches = serde_json::from_str::<serde_json::Value>(&body)
            .map(|actual| json_contains_subset(&actual, subset))
            .unwrap_or(false);
        if !matches {
            return Ok((
                HealthStatus::Unhealthy,
                "response body does not contain expected_json_subset".to_string(),
                json!({"status": status}),
            ));
        }
    }

    Ok((HealthStatus::Healthy, format!("status {status}"), json!({"status": status})))
}

fn json_contains_subset(actual: &serde_json::Value, subset: &serde_json::Value) -> bool {
    match (actual, subset) {
        (serde_json::Value::Object(actual), serde_json::Value::Object(subset)) => subset
            .iter()
            .all(|(key, value)| actual.get(key).map_or(false, |v| json_contains_subset(v, value))),
        _ => actual == subset,
    }
}

#[allow(clippy::too_many_arguments)]
async fn command(
    hypervisor: &dyn HypervisorBackend,
    vm_name: &str,
    program: &str,
    args: &[String],
    expected_exit_code: i32,
    expected_output_substring: Option<&str>,
    run_in_guest: bool,
    timeout: Duration,
) -> Result<(HealthStatus, String, serde_json::Value)> {
    let mut argv = vec![program.to_string()];
    argv.extend(args.iter().cloned());

    let (exit_code, stdout) = if run_in_guest {
        match hypervisor.exec_in_guest(vm_name, &argv, timeout).await? {
            Some(result) => (
                result.exit_code.unwrap_or(-1),
                String::from_utf8_lossy(&result.stdout).into_owned(),
            ),
            None => return Ok((HealthStatus::Unknown, "agent unreachable".to_string(), serde_json::Value::Null)),
        }
    } else {
        match process::run(RunRequest::new(argv).timeout(timeout)).await {
            Ok(out) => (out.exit_code.unwrap_or(-1), out.stdout_string()),
            Err(Error::Timeout(_)) => {
                return Ok((HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null))
            }
            Err(e) => return Ok((HealthStatus::Unhealthy, e.to_string(), serde_json::Value::Null)),
        }
    };

    if exit_code != expected_exit_code {
        return Ok((
            HealthStatus::Unhealthy,
            format!("exit code {exit_code} != {expected_exit_code}"),
            json!({"exit_code": exit_code}),
        ));
    }
    if let Some(substring) = expected_output_substring {
        if !stdout.contains(substring) {
            return Ok((
                HealthStatus::Unhealthy,
                format!("output missing substring {substring:?}"),
                json!({"exit_code": exit_code}),
            ));
        }
    }
    Ok((HealthStatus::Healthy, format!("exit code {exit_code}"), json!({"exit_code": exit_code})))
}

async fn script(
    path: &str,
    exit_code: i32,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<(HealthStatus, String, serde_json::Value)> {
    let mut request = RunRequest::new([path.to_string()]).timeout(timeout);
    for (key, value) in env {
        request = request.env(key, value);
    }
    match process::run(request).await {
        Ok(out) => {
            let actual = out.exit_code.unwrap_or(-1);
            if actual == exit_code {
                Ok((HealthStatus::Healthy, format!("exit code {actual}"), serde_json::Value::Null))
            } else {
                Ok((
                    HealthStatus::Unhealthy,
                    format!("exit code {actual} != {exit_code}"),
                    serde_json::Value::Null,
                ))
            }
        }
        Err(Error::Timeout(_)) => Ok((HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null)),
        Err(e) => Ok((HealthStatus::Unhealthy, e.to_string(), serde_json::Value::Null)),
    }
}

async fn disk(path: &str, warn_percent: f64, critical_percent: f64) -> Result<(HealthStatus, String, serde_json::Value)> {
    let used_percent = disk_used_percent(path)?;
    let status = percent_to_status(used_percent, warn_percent, critical_percent);
    Ok((status, format!("{used_percent:.1}% used"), json!({"used_percent": used_percent})))
}

fn disk_used_percent(path: &str) -> Result<f64> {
    let c_path = std::ffi::CString::new(path).map_err(|_| Error::InvalidArgument("path contains NUL".into()))?;
    // SAFETY: `stat` is zero-initialized and filled in place by `statvfs`;
    // `c_path` outlives the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let total = stat.f_blocks as f64 * stat.f_frsize as f64;
    let free = stat.f_bfree as f64 * stat.f_frsize as f64;
    if total == 0.0 {
        return Ok(0.0);
    }
    Ok((total - free) / total * 100.0)
}

async fn memory(warn_percent: f64, critical_percent: f64) -> Result<(HealthStatus, String, serde_json::Value)> {
    let content = tokio::fs::read_to_string("/proc/meminfo").await?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_meminfo_kb(rest);
        }
    }
    let (Some(total_kb), Some(available_kb)) = (total_kb, available_kb) else {
        return Err(Error::Internal("could not parse /proc/meminfo".into()));
    };
    if total_kb == 0 {
        return Ok((HealthStatus::Healthy, "0 total memory reported".to_string(), serde_json::Value::Null));
    }
    let used_percent = (total_kb.saturating_sub(available_kb)) as f64 / total_kb as f64 * 100.0;
    let status = percent_to_status(used_percent, warn_percent, critical_percent);
    Ok((status, format!("{used_percent:.1}% used"), json!({"used_percent": used_percent})))
}

fn parse_meminfo_kb(rest: &str) -> Option<u64> {
    rest.trim().trim_end_matches("kB").trim().parse().ok()
}

fn percent_to_status(used_percent: f64, warn_percent: f64, critical_percent: f64) -> HealthStatus {
    if used_percent >= critical_percent {
        HealthStatus::Unhealthy
    } else if used_percent >= warn_percent {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

async fn process_count(
    pattern: &str,
    min_count: u32,
    max_count: Option<u32>,
    timeout: Duration,
) -> Result<(HealthStatus, String, serde_json::Value)> {
    let argv = vec!["pgrep".to_string(), "-c".to_string(), "-f".to_string(), pattern.to_string()];
    let out = process::run(RunRequest::new(argv).timeout(timeout)).await?;
    let count: u32 = out.stdout_string().trim().parse().unwrap_or(0);
    let in_range = count >= min_count && max_count.map_or(true, |max| count <= max);
    let status = if in_range { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
    Ok((status, format!("{count} matching process(es)"), json!({"count": count})))
}

async fn dns(name: &str, expected_ip: Option<&str>, timeout: Duration) -> Result<(HealthStatus, String, serde_json::Value)> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host(format!("{name}:0"))).await;
    let addrs: Vec<IpAddr> = match lookup {
        Ok(Ok(iter)) => iter.map(|socket_addr| socket_addr.ip()).collect(),
        Ok(Err(e)) => return Ok((HealthStatus::Unhealthy, e.to_string(), serde_json::Value::Null)),
        Err(_) => return Ok((HealthStatus::Unhealthy, "Timeout".to_string(), serde_json::Value::Null)),
    };
    if addrs.is_empty() {
        return Ok((HealthStatus::Unhealthy, format!("{name} did not resolve"), serde_json::Value::Null));
    }

    let addr_strings: Vec<String> = addrs.iter().map(ToString::to_string).collect();
    if let Some(expected) = expected_ip {
        let expected: IpAddr = expected
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid expected_ip: {expected}")))?;
        if !addrs.contains(&expected) {
            return Ok((
                HealthStatus::Unhealthy,
                format!("{name} resolved to {addr_strings:?}, expected {expected}"),
                json!({"addresses": addr_strings}),
            ));
        }
    }
    Ok((HealthStatus::Healthy, format!("{name} resolved"), json!({"addresses": addr_strings})))
}
