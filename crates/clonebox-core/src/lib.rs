pub mod audit;
pub mod cloudinit;
pub mod container;
pub mod disk;
pub mod error;
pub mod health;
pub mod hypervisor;
pub mod network;
pub mod orchestrator;
pub mod process;
pub mod secrets;
pub mod snapshot;
pub mod transaction;

pub use error::{Error, Result};
