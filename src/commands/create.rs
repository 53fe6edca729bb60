use anyhow::Result;
use tracing::info;

use crate::cli::CreateArgs;
use crate::commands::build_mapper;
use crate::config::Config;

pub async fn cmd_create(args: CreateArgs) -> Result<()> {
    let config = Config::from_env();
    let (_db, _firewall, mapper) = build_mapper(&config)?;

    info!(
        target_addr = %args.target_addr,
        target_port = args.target_port,
        "creating port mapping"
    );
    let conn_port = mapper
        .create(
            &args.target_addr,
            args.target_port,
            &args.target_name,
            &args.target_component,
        )
        .await?;

    println!("{conn_port}");
    Ok(())
}
