pub mod config;
pub mod devstack;
pub mod logging;

pub use config::{DevstackConfig, FaultKind, LoggingConfig, NodeConfig, TransportKind};
pub use devstack::Devstack;
