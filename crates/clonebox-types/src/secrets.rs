use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recognised secret providers, tried in the explicit order given at
/// resolver construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretProvider {
    Env,
    Dotenv,
    Vault,
    Sops,
    Age,
}

impl fmt::Display for SecretProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecretProvider::Env => "env",
            SecretProvider::Dotenv => "dotenv",
            SecretProvider::Vault => "vault",
            SecretProvider::Sops => "sops",
            SecretProvider::Age => "age",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretReference {
    pub provider: SecretProvider,
    pub path: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub provider_config: BTreeMap<String, String>,
}

/// A resolved secret. `Display`/`Debug` never render `value`; only the
/// fixed redacted token, so an accidental `format!("{secret}")` in a log
/// line or persisted artifact cannot leak plaintext.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret {
    pub value: String,
    pub provider_name: SecretProvider,
    pub retrieved_at: DateTime<Utc>,
}

const REDACTED: &str = "<redacted>";

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("value", &REDACTED)
            .field("provider_name", &self.provider_name)
            .field("retrieved_at", &self.retrieved_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_display_never_leaks_value() {
        let secret = Secret {
            value: "hunter2-verysecret".into(),
            provider_name: SecretProvider::Env,
            retrieved_at: Utc::now(),
        };
        assert_eq!(format!("{secret}"), "<redacted>");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
