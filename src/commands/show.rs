use std::sync::Arc;

use anyhow::Result;

use crate::cli::ShowArgs;
use crate::config::Config;
use crate::firewall::{FireWall, Table};
use crate::shell::SystemRunner;

pub async fn cmd_show(args: ShowArgs) -> Result<()> {
    let config = Config::from_env();
    let firewall = FireWall::new(Arc::new(SystemRunner), &config);
    let table: Table = args.table.parse()?;

    if args.raw {
        print!("{}", firewall.show_raw(table).await?);
        return Ok(());
    }

    let rules = firewall.show(table).await?;
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}
