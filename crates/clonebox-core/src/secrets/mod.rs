//! Layered secrets resolution (spec §4.2). Providers are tried in the
//! explicit order supplied at construction; the first available provider
//! whose `get` returns a value wins.

mod providers;

use std::time::Duration;

use clonebox_types::{Secret, SecretProvider, SecretReference};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{self, RunRequest};

pub use providers::{AgeProvider, DotenvProvider, EnvProvider, SopsProvider, VaultProvider};

const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*-_=+";

/// A single configured provider, availability-tested before use.
#[async_trait::async_trait]
pub trait ProviderBackend: Send + Sync {
    fn name(&self) -> SecretProvider;
    async fn is_available(&self, reference: &SecretReference) -> bool;
    async fn get(&self, reference: &SecretReference) -> Result<Option<String>>;
}

pub struct SecretsResolver {
    providers: Vec<Box<dyn ProviderBackend>>,
}

impl SecretsResolver {
    pub fn new(providers: Vec<Box<dyn ProviderBackend>>) -> Self {
        Self { providers }
    }

    /// Default resolver: env, dotenv, vault, sops, age, in that order —
    /// the order named first in spec §4.2's provider table.
    pub fn default_order(vault: VaultProvider) -> Self {
        Self::new(vec![
            Box::new(EnvProvider),
            Box::new(DotenvProvider),
            Box::new(vault),
            Box::new(SopsProvider),
            Box::new(AgeProvider),
        ])
    }

    pub async fn resolve(&self, reference: &SecretReference) -> Result<Secret> {
        for provider in &self.providers {
            if provider.name() != reference.provider {
                continue;
            }
            if !provider.is_available(reference).await {
                continue;
            }
            match provider.get(reference).await {
                Ok(Some(value)) => {
                    return Ok(Secret {
                        value,
                        provider_name: provider.name(),
                        retrieved_at: chrono::Utc::now(),
                    });
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(provider = %provider.name(), error = %err, "secrets: provider error, skipping");
                    return Err(err);
                }
            }
        }
        Err(Error::SecretNotFound {
            provider: reference.provider.to_string(),
            path: reference.path.clone(),
        })
    }
}

/// Generates a password of at least 16 characters using a cryptographic
/// RNG over alphanumeric + punctuation.
pub fn generate_password(length: usize) -> String {
    let length = length.max(16);
    let mut rng = OsRng;
    (0..length)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % PASSWORD_ALPHABET.len();
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

/// A generated one-time password plus the cloud-init `chpasswd` fragment
/// that forces a change on first login (spec §4.2).
pub struct OneTimePassword {
    pub password: String,
    pub chpasswd_expire: bool,
}

pub fn generate_one_time_password() -> OneTimePassword {
    OneTimePassword {
        password: generate_password(16),
        chpasswd_expire: true,
    }
}

pub struct GeneratedKeypair {
    pub private_key_pem: Vec<u8>,
    pub public_key_line: String,
}

/// Invokes the system key generator (`ssh-keygen`) via the Process
/// Runner; CloneBox never implements key generation itself.
pub async fn generate_ssh_keypair(out_dir: &std::path::Path) -> Result<GeneratedKeypair> {
    tokio::fs::create_dir_all(out_dir).await?;
    let key_path = out_dir.join("ssh_key");
    let key_path_str = key_path.to_string_lossy().to_string();
    let _ = tokio::fs::remove_file(&key_path).await;
    let _ = tokio::fs::remove_file(format!("{key_path_str}.pub")).await;

    let req = RunRequest::new([
        "ssh-keygen",
        "-t",
        "ed25519",
        "-N",
        "",
        "-f",
        &key_path_str,
        "-q",
    ])
    .timeout(Duration::from_secs(10));
    let out = process::run(req).await?;
    if !out.success() {
        return Err(Error::ExternalToolError {
            tool: "ssh-keygen".into(),
            exit_code: out.exit_code,
            stderr: out.stderr_string(),
        });
    }

    let private_key_pem = tokio::fs::read(&key_path).await?;
    let public_key_line = tokio::fs::read_to_string(format!("{key_path_str}.pub")).await?;
    debug!(path = %key_path_str, "secrets: generated ssh keypair");
    Ok(GeneratedKeypair {
        private_key_pem,
        public_key_line: public_key_line.trim().to_string(),
    })
}

/// Hashes a password for the deprecated `password` auth variant with a
/// strong, salted algorithm. `argon2` exceeds the SHA-512-crypt floor
/// spec.md requires.
pub fn hash_password(mut plaintext: String) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let hash = Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("password hash failed: {e}")))?
        .to_string();
    // Zero the plaintext copy we control; the caller's original still
    // exists in its own `Secret`, which is dropped by the caller.
    unsafe {
        let bytes = plaintext.as_bytes_mut();
        for b in bytes.iter_mut() {
            *b = 0;
        }
    }
    plaintext.clear();
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_meets_length_floor() {
        assert_eq!(generate_password(8).len(), 16);
        assert_eq!(generate_password(24).len(), 24);
    }

    #[test]
    fn hash_password_is_not_plaintext() {
        let hash = hash_password("hunter2-verysecret".to_string()).unwrap();
        assert!(!hash.contains("hunter2-verysecret"));
        assert!(hash.starts_with("$argon2"));
    }
}
