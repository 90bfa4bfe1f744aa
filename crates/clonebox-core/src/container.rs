//! Explicit dependency wiring, read once from the environment at startup.
//! Spec §5/§9 allow exactly two sources of process-wide mutable state: this
//! builder's singletons and the audit sink. No reflection, no service
//! locator — every field is built by hand, the way `AppState` is built in
//! `main()` against `std::env::var` reads.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::audit::AuditSink;
use crate::hypervisor::libvirt::LibvirtBackend;
use crate::hypervisor::HypervisorBackend;
use crate::network::NetworkManager;
use crate::orchestrator::{ConfigResolver, FileConfigResolver, Orchestrator};
use crate::secrets::{SecretsResolver, VaultProvider};

/// Process-wide singletons. `Builder::default()` reads `CLONEBOX_*`
/// environment variables (and `.env`, via `dotenvy`) to construct every
/// field; missing configuration falls back to documented defaults, never
/// a panic.
pub struct Builder {
    pub hypervisor: Arc<dyn HypervisorBackend>,
    pub network: Arc<NetworkManager>,
    pub secrets: Arc<SecretsResolver>,
    pub audit: Arc<AuditSink>,
    pub orchestrator: Arc<Orchestrator>,
    pub images_root: String,
    pub journal_dir: String,
}

impl Default for Builder {
    fn default() -> Self {
        let _ = dotenvy::dotenv();

        let libvirt_uri =
            std::env::var("CLONEBOX_LIBVIRT_URI").unwrap_or_else(|_| "qemu:///system".to_string());
        let hypervisor: Arc<dyn HypervisorBackend> = Arc::new(LibvirtBackend::new(libvirt_uri));

        let network_uri =
            std::env::var("CLONEBOX_NETWORK_URI").unwrap_or_else(|_| "qemu:///system".to_string());
        let network = Arc::new(NetworkManager::new(network_uri));

        let secrets = Arc::new(SecretsResolver::default_order(VaultProvider::new()));

        let state_root =
            std::env::var("CLONEBOX_STATE_ROOT").unwrap_or_else(|_| "/var/lib/clonebox".to_string());
        let audit = Arc::new(AuditSink::new(&state_root));

        let images_root =
            std::env::var("CLONEBOX_IMAGES_ROOT").unwrap_or_else(|_| format!("{state_root}/vms"));
        let journal_dir =
            std::env::var("CLONEBOX_JOURNAL_DIR").unwrap_or_else(|_| format!("{state_root}/journal"));

        let config_resolver: Arc<dyn ConfigResolver> = Arc::new(FileConfigResolver);
        let orchestrator = Orchestrator::new(
            hypervisor.clone(),
            secrets.clone(),
            config_resolver,
            journal_dir.clone(),
            images_root.clone(),
        );

        Self {
            hypervisor,
            network,
            secrets,
            audit,
            orchestrator,
            images_root,
            journal_dir,
        }
    }
}

/// `CLONEBOX_LOG` (falling back to `RUST_LOG`) selects the filter, matching
/// the manager's `EnvFilter::try_from_default_env` idiom.
pub fn init_logging() {
    let filter = std::env::var("CLONEBOX_LOG")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("warn,clonebox_core=info,clonebox_cli=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
