//! Assembles the libvirt domain XML document for a `VmConfig`. Grounded
//! on `other_examples`' `libvirt-backend.rs` `DomainXmlBuilder`, extended
//! to cover resource tuning, the guest-agent channel, and the user-mode
//! network port-forward rule spec §4.3 requires.

use clonebox_types::{NetworkMode, VmConfig};

pub struct DomainXmlBuilder<'a> {
    config: &'a VmConfig,
    disk_path: String,
    seed_iso_path: String,
    serial_log_path: String,
    ssh_host_port: Option<u16>,
    bridge_name: Option<String>,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(config: &'a VmConfig, disk_path: String, seed_iso_path: String) -> Self {
        Self {
            config,
            disk_path,
            seed_iso_path,
            serial_log_path: String::new(),
            ssh_host_port: None,
            bridge_name: None,
        }
    }

    pub fn serial_log_path(mut self, path: String) -> Self {
        self.serial_log_path = path;
        self
    }

    pub fn ssh_host_port(mut self, port: u16) -> Self {
        self.ssh_host_port = Some(port);
        self
    }

    pub fn bridge_name(mut self, bridge: String) -> Self {
        self.bridge_name = Some(bridge);
        self
    }

    pub fn build(&self) -> String {
        let name = &self.config.name;
        let vcpus = self.config.vcpus;
        let memory_kib = self.config.memory_bytes / 1024;

        let (cpu_tuning, mem_tuning, blkio_tuning) = self.resource_tuning_xml();
        let interface_xml = self.interface_xml();
        let mount_xml = self.filesystem_mounts_xml();

        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  {cpu_tuning}
  {mem_tuning}
  <os>
    <type arch='x86_64' machine='pc-q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed_iso_path}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    {interface_xml}
    {mount_xml}
    {blkio_tuning}
    <console type='file'>
      <source path='{serial_log_path}'/>
      <target type='serial' port='0'/>
    </console>
    <serial type='file'>
      <source path='{serial_log_path}'/>
      <target port='0'/>
    </serial>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
  </devices>
</domain>"#,
            disk_path = self.disk_path,
            seed_iso_path = self.seed_iso_path,
            serial_log_path = self.serial_log_path,
        )
    }

    fn resource_tuning_xml(&self) -> (String, String, String) {
        let Some(limits) = self.config.resource_limits else {
            return (String::new(), String::new(), String::new());
        };
        let mut cputune_inner = String::new();
        if let Some(shares) = limits.cpu_shares {
            cputune_inner.push_str(&format!("<shares>{shares}</shares>"));
        }
        if let (Some(quota), Some(period)) = (limits.cpu_quota_us, limits.cpu_period_us) {
            cputune_inner.push_str(&format!(
                "<period>{period}</period><quota>{quota}</quota>"
            ));
        }
        let cpu_tuning = if cputune_inner.is_empty() {
            String::new()
        } else {
            format!("<cputune>{cputune_inner}</cputune>")
        };

        let mut memtune_inner = String::new();
        if let Some(hard) = limits.memory_hard_bytes {
            memtune_inner.push_str(&format!("<hard_limit unit='KiB'>{}</hard_limit>", hard / 1024));
        }
        if let Some(soft) = limits.memory_soft_bytes {
            memtune_inner.push_str(&format!("<soft_limit unit='KiB'>{}</soft_limit>", soft / 1024));
        }
        if let Some(swap) = limits.memory_swap_bytes {
            memtune_inner.push_str(&format!("<swap_hard_limit unit='KiB'>{}</swap_hard_limit>", swap / 1024));
        }
        let mem_tuning = if memtune_inner.is_empty() {
            String::new()
        } else {
            format!("<memtune>{memtune_inner}</memtune>")
        };

        let mut blkio_inner = String::new();
        if let Some(bps) = limits.block_io_bps {
            blkio_inner.push_str(&format!(
                "<device><path>{}</path><write_bytes_sec>{bps}</write_bytes_sec></device>",
                self.disk_path
            ));
        }
        if let Some(iops) = limits.block_io_iops {
            blkio_inner.push_str(&format!(
                "<device><path>{}</path><write_iops_sec>{iops}</write_iops_sec></device>",
                self.disk_path
            ));
        }
        let blkio_tuning = if blkio_inner.is_empty() {
            String::new()
        } else {
            format!("<blkiotune>{blkio_inner}</blkiotune>")
        };

        (cpu_tuning, mem_tuning, blkio_tuning)
    }

    fn interface_xml(&self) -> String {
        let bandwidth = self
            .config
            .resource_limits
            .and_then(|limits| limits.network_rate_bps)
            .map(|bps| {
                let kbps = bps / 1000;
                format!(
                    "<bandwidth><inbound average='{kbps}'/><outbound average='{kbps}'/></bandwidth>"
                )
            })
            .unwrap_or_default();

        match self.config.network_mode {
            NetworkMode::UserMode => {
                let host_port = self.ssh_host_port.unwrap_or(2222);
                format!(
                    r#"<interface type='user'>
      <target dev='user0'/>
      <model type='virtio'/>
      <portForward proto='tcp'>
        <range start='{host_port}' to='22'/>
      </portForward>
      {bandwidth}
    </interface>"#
                )
            }
            NetworkMode::DefaultBridge => {
                format!(
                    r#"<interface type='network'>
      <source network='default'/>
      <model type='virtio'/>
      {bandwidth}
    </interface>"#
                )
            }
            NetworkMode::CustomBridge | NetworkMode::Auto => {
                let bridge = self.bridge_name.clone().unwrap_or_else(|| "virbr0".into());
                format!(
                    r#"<interface type='bridge'>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
      {bandwidth}
    </interface>"#
                )
            }
        }
    }

    fn filesystem_mounts_xml(&self) -> String {
        self.config
            .path_mounts
            .iter()
            .map(|mount| {
                let access = if mount.read_only { "ro" } else { "rw" };
                format!(
                    r#"<filesystem type='mount' accessmode='passthrough'>
      <driver type='virtiofs'/>
      <source dir='{host}'/>
      <target dir='{guest}'/>
      <readonly access='{access}'/>
    </filesystem>"#,
                    host = mount.host_path,
                    guest = mount.guest_path,
                )
            })
            .collect::<Vec<_>>()
            .join("\n    ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonebox_types::{AuthConfig, ResourceLimits};
    use std::collections::BTreeSet;

    fn sample_config(mode: NetworkMode) -> VmConfig {
        VmConfig {
            name: "dev".into(),
            vcpus: 2,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            disk_size_bytes: 20 * 1024 * 1024 * 1024,
            base_image_path: "/base.qcow2".into(),
            network_mode: mode,
            username: "dev".into(),
            auth_config: AuthConfig::OneTimePassword { length: 16 },
            packages: BTreeSet::new(),
            services: BTreeSet::new(),
            path_mounts: vec![],
            post_commands: vec![],
            resource_limits: None,
            health_check_configs: vec![],
            snapshot_policy: None,
        }
    }

    #[test]
    fn user_mode_network_forwards_port_22() {
        let config = sample_config(NetworkMode::UserMode);
        let xml = DomainXmlBuilder::new(&config, "/disk".into(), "/seed.iso".into())
            .ssh_host_port(2200)
            .build();
        assert!(xml.contains("to='22'"));
        assert!(xml.contains("start='2200'"));
    }

    #[test]
    fn serial_console_pins_caller_supplied_log_path() {
        let config = sample_config(NetworkMode::DefaultBridge);
        let xml = DomainXmlBuilder::new(&config, "/disk".into(), "/seed.iso".into())
            .serial_log_path("/var/log/clonebox/dev/serial.log".into())
            .build();
        assert!(xml.contains("/var/log/clonebox/dev/serial.log"));
    }

    #[test]
    fn includes_guest_agent_channel() {
        let config = sample_config(NetworkMode::DefaultBridge);
        let xml = DomainXmlBuilder::new(&config, "/disk".into(), "/seed.iso".into()).build();
        assert!(xml.contains("org.qemu.guest_agent.0"));
    }

    #[test]
    fn resource_limits_emit_memtune_and_interface_bandwidth() {
        let mut config = sample_config(NetworkMode::DefaultBridge);
        config.resource_limits = Some(ResourceLimits {
            memory_hard_bytes: Some(2 * 1024 * 1024 * 1024),
            memory_soft_bytes: Some(1024 * 1024 * 1024),
            memory_swap_bytes: Some(512 * 1024 * 1024),
            network_rate_bps: Some(125_000_000),
            ..Default::default()
        });
        let xml = DomainXmlBuilder::new(&config, "/disk".into(), "/seed.iso".into()).build();
        assert!(xml.contains("<memtune>"));
        assert!(xml.contains("<hard_limit unit='KiB'>2097152</hard_limit>"));
        assert!(xml.contains("<soft_limit unit='KiB'>1048576</soft_limit>"));
        assert!(xml.contains("<swap_hard_limit unit='KiB'>524288</swap_hard_limit>"));
        assert!(xml.contains("<bandwidth>"));
        assert!(xml.contains("average='125000'"));
    }
}
