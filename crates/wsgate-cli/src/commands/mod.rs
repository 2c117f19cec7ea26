pub mod deploy;
pub mod init;
pub mod inspect;
pub mod verify;

use std::path::Path;

use anyhow::Context;

use wsgate_core::GatewayConfig;
use wsgate_state::StateStore;

pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    GatewayConfig::from_file(path)
        .with_context(|| format!("loading gateway config {}", path.display()))
}

pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let path = data_dir.join("state.redb");
    StateStore::open(&path).with_context(|| format!("opening state store {}", path.display()))
}
