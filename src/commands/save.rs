use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::firewall::FireWall;
use crate::shell::SystemRunner;

pub async fn cmd_save() -> Result<()> {
    let config = Config::from_env();
    let firewall = FireWall::new(Arc::new(SystemRunner), &config);

    firewall.save_rules().await?;
    info!(rules_file = %config.rules_file.display(), "firewall rules persisted");
    Ok(())
}
