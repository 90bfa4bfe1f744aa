use std::path::Path;
use std::time::Duration;

use clonebox_types::{SecretProvider, SecretReference};

use super::ProviderBackend;
use crate::error::{Error, Result};
use crate::process::{self, RunRequest};

pub struct EnvProvider;

#[async_trait::async_trait]
impl ProviderBackend for EnvProvider {
    fn name(&self) -> SecretProvider {
        SecretProvider::Env
    }

    async fn is_available(&self, _reference: &SecretReference) -> bool {
        true
    }

    async fn get(&self, reference: &SecretReference) -> Result<Option<String>> {
        Ok(std::env::var(&reference.path).ok())
    }
}

pub struct DotenvProvider;

#[async_trait::async_trait]
impl ProviderBackend for DotenvProvider {
    fn name(&self) -> SecretProvider {
        SecretProvider::Dotenv
    }

    async fn is_available(&self, _reference: &SecretReference) -> bool {
        Path::new(".env").exists()
    }

    async fn get(&self, reference: &SecretReference) -> Result<Option<String>> {
        for item in dotenvy::dotenv_iter().map_err(|e| Error::ProviderError {
            provider: "dotenv".into(),
            message: e.to_string(),
        })? {
            let (key, value) = item.map_err(|e| Error::ProviderError {
                provider: "dotenv".into(),
                message: e.to_string(),
            })?;
            if key == reference.path {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Vault KV v2 provider. `provider_config["addr"]`/`["token"]` give the
/// server address and an already-obtained token; CloneBox does not
/// perform Vault authentication itself.
pub struct VaultProvider {
    client: reqwest::Client,
}

impl VaultProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for VaultProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderBackend for VaultProvider {
    fn name(&self) -> SecretProvider {
        SecretProvider::Vault
    }

    async fn is_available(&self, reference: &SecretReference) -> bool {
        reference.provider_config.contains_key("addr")
            && reference.provider_config.contains_key("token")
    }

    async fn get(&self, reference: &SecretReference) -> Result<Option<String>> {
        let addr = reference
            .provider_config
            .get("addr")
            .cloned()
            .unwrap_or_default();
        let token = reference
            .provider_config
            .get("token")
            .cloned()
            .unwrap_or_default();
        let url = format!("{}/v1/{}", addr.trim_end_matches('/'), reference.path);
        let response = self
            .client
            .get(url)
            .header("X-Vault-Token", token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::ProviderError {
                provider: "vault".into(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = response.json().await.map_err(|e| Error::ProviderError {
            provider: "vault".into(),
            message: e.to_string(),
        })?;
        let field = reference.key.as_deref().unwrap_or("value");
        Ok(body["data"]["data"][field]
            .as_str()
            .map(|s| s.to_string()))
    }
}

/// Decrypts a `sops`-encrypted file via the Process Runner and looks up a
/// dotted path into the decrypted JSON document.
pub struct SopsProvider;

#[async_trait::async_trait]
impl ProviderBackend for SopsProvider {
    fn name(&self) -> SecretProvider {
        SecretProvider::Sops
    }

    async fn is_available(&self, reference: &SecretReference) -> bool {
        which("sops").await && Path::new(&reference.path).exists()
    }

    async fn get(&self, reference: &SecretReference) -> Result<Option<String>> {
        let req = RunRequest::new(["sops", "-d", "--output-type", "json", &reference.path])
            .timeout(Duration::from_secs(10));
        let out = process::run(req).await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "sops".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        lookup_dotted(&out.stdout_string(), reference.key.as_deref())
    }
}

/// Decrypts an `age`-encrypted file via the Process Runner with an
/// identity file from `provider_config["identity"]`.
pub struct AgeProvider;

#[async_trait::async_trait]
impl ProviderBackend for AgeProvider {
    fn name(&self) -> SecretProvider {
        SecretProvider::Age
    }

    async fn is_available(&self, reference: &SecretReference) -> bool {
        let has_identity = reference
            .provider_config
            .get("identity")
            .map(|p| Path::new(p).exists())
            .unwrap_or(false);
        which("age").await && has_identity && Path::new(&reference.path).exists()
    }

    async fn get(&self, reference: &SecretReference) -> Result<Option<String>> {
        let identity = reference
            .provider_config
            .get("identity")
            .cloned()
            .unwrap_or_default();
        let req = RunRequest::new(["age", "-d", "-i", &identity, &reference.path])
            .timeout(Duration::from_secs(10));
        let out = process::run(req).await?;
        if !out.success() {
            return Err(Error::ExternalToolError {
                tool: "age".into(),
                exit_code: out.exit_code,
                stderr: out.stderr_string(),
            });
        }
        lookup_dotted(&out.stdout_string(), reference.key.as_deref())
    }
}

fn lookup_dotted(document: &str, key: Option<&str>) -> Result<Option<String>> {
    let value: serde_json::Value = serde_json::from_str(document)?;
    let Some(key) = key else {
        return Ok(value.as_str().map(|s| s.to_string()));
    };
    let mut cursor = &value;
    for segment in key.split('.') {
        cursor = &cursor[segment];
    }
    Ok(cursor.as_str().map(|s| s.to_string()))
}

async fn which(binary: &str) -> bool {
    let req = RunRequest::new(["which", binary]).timeout(Duration::from_secs(2));
    process::run(req).await.map(|o| o.success()).unwrap_or(false)
}
