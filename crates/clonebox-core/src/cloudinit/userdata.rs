//! Assembles the cloud-init `user-data`/`meta-data`/`network-config`
//! documents as `serde_yaml::Value` trees, then serializes with the
//! `#cloud-config` magic line spec §6 requires.

use clonebox_types::{NetworkMode, PathMount, VmConfig};
use serde_yaml::{Mapping, Value};

pub struct UserData {
    pub username: String,
    pub ssh_authorized_keys: Vec<String>,
    pub lock_passwd: bool,
    pub ssh_pwauth: bool,
    pub passwd_hash: Option<String>,
    pub packages: Vec<String>,
    pub services: Vec<String>,
    pub post_commands: Vec<String>,
    pub path_mounts: Vec<PathMount>,
    pub bootcmd_echo: Option<String>,
    pub chpasswd_expire: Option<bool>,
}

fn s(value: impl Into<String>) -> Value {
    Value::String(value.into())
}

impl UserData {
    pub fn render(&self) -> String {
        let mut root = Mapping::new();

        let mut user = Mapping::new();
        user.insert(s("name"), s(self.username.clone()));
        user.insert(s("sudo"), s("ALL=(ALL) NOPASSWD:ALL"));
        user.insert(s("shell"), s("/bin/bash"));
        user.insert(
            s("groups"),
            Value::Sequence(vec![s("sudo")]),
        );
        if !self.ssh_authorized_keys.is_empty() {
            user.insert(
                s("ssh_authorized_keys"),
                Value::Sequence(self.ssh_authorized_keys.iter().cloned().map(s).collect()),
            );
        }
        if let Some(hash) = &self.passwd_hash {
            user.insert(s("passwd"), s(hash.clone()));
        }
        user.insert(s("lock_passwd"), Value::Bool(self.lock_passwd));

        root.insert(s("users"), Value::Sequence(vec![Value::Mapping(user)]));
        root.insert(s("ssh_pwauth"), Value::Bool(self.ssh_pwauth));
        // The root login is always disabled; only the created user may
        // authenticate, with passwordless sudo.
        root.insert(s("disable_root"), Value::Bool(true));

        if !self.packages.is_empty() {
            root.insert(s("package_update"), Value::Bool(true));
            root.insert(s("package_upgrade"), Value::Bool(false));
            root.insert(
                s("packages"),
                Value::Sequence(self.packages.iter().cloned().map(s).collect()),
            );
        }

        if let Some(expire) = self.chpasswd_expire {
            let mut chpasswd = Mapping::new();
            chpasswd.insert(s("expire"), Value::Bool(expire));
            root.insert(s("chpasswd"), Value::Mapping(chpasswd));
        }

        if let Some(echo) = &self.bootcmd_echo {
            root.insert(
                s("bootcmd"),
                Value::Sequence(vec![s(format!("echo '{echo}' > /dev/console"))]),
            );
        }

        let mut runcmd: Vec<Value> = self
            .services
            .iter()
            .map(|svc| s(format!("systemctl enable --now {svc}")))
            .collect();
        runcmd.extend(self.post_commands.iter().cloned().map(s));
        if !runcmd.is_empty() {
            root.insert(s("runcmd"), Value::Sequence(runcmd));
        }

        if !self.path_mounts.is_empty() {
            let mounts: Vec<Value> = self
                .path_mounts
                .iter()
                .enumerate()
                .map(|(i, mount)| {
                    let tag = format!("mount{i}");
                    Value::Sequence(vec![
                        s(tag),
                        s(mount.guest_path.clone()),
                        s("virtiofs"),
                        s(if mount.read_only { "ro" } else { "defaults" }),
                    ])
                })
                .collect();
            root.insert(s("mounts"), Value::Sequence(mounts));
        }

        format!("#cloud-config\n{}", serde_yaml::to_string(&Value::Mapping(root)).unwrap_or_default())
    }
}

pub fn render_meta_data(instance_id: &str, hostname: &str) -> String {
    let mut root = Mapping::new();
    root.insert(s("instance-id"), s(instance_id.to_string()));
    root.insert(s("local-hostname"), s(hostname.to_string()));
    serde_yaml::to_string(&Value::Mapping(root)).unwrap_or_default()
}

/// Cloud-init network-config v2, emitted only for `custom-bridge` and
/// `default-bridge` — `auto`/`user-mode` rely on cloud-init's defaults.
pub fn render_network_config(config: &VmConfig) -> Option<String> {
    match config.network_mode {
        NetworkMode::Auto | NetworkMode::UserMode => None,
        NetworkMode::DefaultBridge | NetworkMode::CustomBridge => {
            let mut ethernets = Mapping::new();
            let mut eth0 = Mapping::new();
            eth0.insert(s("dhcp4"), Value::Bool(true));
            ethernets.insert(s("eth0"), Value::Mapping(eth0));

            let mut network = Mapping::new();
            network.insert(s("version"), Value::Number(2.into()));
            network.insert(s("ethernets"), Value::Mapping(ethernets));

            let mut root = Mapping::new();
            root.insert(s("network"), Value::Mapping(network));
            Some(serde_yaml::to_string(&Value::Mapping(root)).unwrap_or_default())
        }
    }
}
