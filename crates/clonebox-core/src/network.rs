//! Ensures virtual networks exist/are active and reports guest IPs (spec
//! §4.5). Wraps the libvirt network API (`virsh net-*` semantics) behind
//! the same Process-Runner seam the Disk Manager uses, and serves as the
//! DHCP-lease fallback for `HypervisorBackend::ip_addresses`.

use std::collections::HashSet;
use std::net::TcpListener;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{self, RunRequest};

const PORT_RETRY_BOUND: usize = 5;

pub struct NetworkManager {
    connection_uri: String,
}

impl NetworkManager {
    pub fn new(connection_uri: impl Into<String>) -> Self {
        Self {
            connection_uri: connection_uri.into(),
        }
    }

    /// Ensures the named libvirt network exists and is active, defining
    /// and starting it from `xml` if necessary.
    pub async fn ensure_network(&self, name: &str, xml: &str) -> Result<()> {
        if !self.network_exists(name).await? {
            let out = self
                .virsh(["net-define", "/dev/stdin"], Some(xml.as_bytes().to_vec()))
                .await?;
            if !out.success() {
                return Err(Error::ExternalToolError {
                    tool: "virsh".into(),
                    exit_code: out.exit_code,
                    stderr: out.stderr_string(),
                });
            }
            info!(network = name, "network: defined");
        }
        if !self.network_active(name).await? {
            let out = self.virsh(["net-start", name], None).await?;
            if !out.success() {
                return Err(Error::ExternalToolError {
                    tool: "virsh".into(),
                    exit_code: out.exit_code,
                    stderr: out.stderr_string(),
                });
            }
            info!(network = name, "network: started");
        }
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let out = self.virsh(["net-info", name], None).await?;
        Ok(out.success())
    }

    async fn network_active(&self, name: &str) -> Result<bool> {
        let out = self.virsh(["net-info", name], None).await?;
        Ok(out.stdout_string().lines().any(|line| {
            line.trim_start().starts_with("Active:") && line.contains("yes")
        }))
    }

    /// Reports guest IPs via DHCP lease inspection on the managed
    /// network — the fallback path spec §4.3 names for when the
    /// guest-agent interface query comes back empty.
    pub async fn dhcp_leases(&self, network: &str, mac_address: &str) -> Result<Vec<String>> {
        let out = self
            .virsh(["net-dhcp-leases", network], None)
            .await?;
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout_string()
            .lines()
            .filter(|line| line.contains(mac_address))
            .filter_map(|line| {
                line.split_whitespace()
                    .find(|field| field.contains('/') && field.chars().next().unwrap_or(' ').is_ascii_digit())
                    .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string())
            })
            .collect())
    }

    async fn virsh<'a>(
        &self,
        args: impl IntoIterator<Item = &'a str>,
        stdin: Option<Vec<u8>>,
    ) -> Result<process::RunOutput> {
        let mut argv = vec!["virsh".to_string(), "-c".to_string(), self.connection_uri.clone()];
        argv.extend(args.into_iter().map(String::from));
        let mut req = RunRequest::new(argv).timeout(Duration::from_secs(15));
        if let Some(data) = stdin {
            req = req.stdin(data);
        }
        process::run(req).await
    }
}

/// Atomically reserves a free TCP host port for user-mode networking by
/// binding and immediately releasing it, then writing a marker file
/// before the domain is defined. Collisions in a concurrent create are
/// retried up to `PORT_RETRY_BOUND` times (spec §5).
pub async fn allocate_host_port(range: std::ops::RangeInclusive<u16>, marker_dir: &str) -> Result<u16> {
    tokio::fs::create_dir_all(marker_dir).await?;
    let mut rng = rand::thread_rng();
    let mut tried: HashSet<u16> = HashSet::new();

    for _ in 0..PORT_RETRY_BOUND.max(range.clone().count()) {
        let port = rng.gen_range(range.clone());
        if tried.contains(&port) {
            continue;
        }
        tried.insert(port);

        let bind_ok = TcpListener::bind(("127.0.0.1", port)).is_ok();
        if !bind_ok {
            continue;
        }

        let marker_path = format!("{marker_dir}/{port}.port");
        match tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&marker_path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(port.to_string().as_bytes()).await?;
                debug!(port, "network: allocated host port");
                return Ok(port);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    warn!(marker_dir, "network: exhausted port allocation retries");
    Err(Error::Internal("no free host port in range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_ports_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let a = allocate_host_port(20000..=20100, dir.path().to_str().unwrap())
            .await
            .unwrap();
        let b = allocate_host_port(20000..=20100, dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}
