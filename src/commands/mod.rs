mod addrs;
mod create;
mod destroy;
mod ls;
mod save;
mod show;

pub use addrs::cmd_addrs;
pub use create::cmd_create;
pub use destroy::cmd_destroy;
pub use ls::cmd_ls;
pub use save::cmd_save;
pub use show::cmd_show;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db::Database;
use crate::firewall::FireWall;
use crate::portmap::PortMapper;
use crate::shell::SystemRunner;

/// Wire the stores up from the ambient configuration.
pub(crate) fn build_mapper(config: &Config) -> Result<(Arc<Database>, Arc<FireWall>, PortMapper)> {
    if let Some(dir) = config.database_path.parent() {
        std::fs::create_dir_all(dir).context("creating database directory")?;
    }
    let db = Arc::new(Database::open(config).context("opening record database")?);
    let firewall = Arc::new(FireWall::new(Arc::new(SystemRunner), config));
    let mapper = PortMapper::new(Arc::clone(&db), Arc::clone(&firewall));
    Ok((db, firewall, mapper))
}
