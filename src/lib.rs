pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::{CliConfig, Command};

pub use adapters::{
    memory_store::{MemoryStore, StoreSnapshot},
    notifier::{LogNotifier, WebhookNotifier},
};
pub use config::{cli::SnapshotFile, toml_config::EngineConfig};
pub use core::{
    chain_binding::{BindOutcome, ProvisionalOutcome},
    engine::ReferralEngine,
    registration::NewMember,
};
pub use utils::error::{EngineError, ErrorKind, Result};
