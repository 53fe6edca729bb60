use anyhow::Result;
use tracing::info;

use crate::cli::DestroyArgs;
use crate::commands::build_mapper;
use crate::config::Config;

pub async fn cmd_destroy(args: DestroyArgs) -> Result<()> {
    let config = Config::from_env();
    let (_db, _firewall, mapper) = build_mapper(&config)?;

    info!(conn_port = args.conn_port, "destroying port mapping");
    mapper.destroy(args.conn_port).await?;
    Ok(())
}
