use anyhow::Result;

use crate::cli::LsArgs;
use crate::commands::build_mapper;
use crate::config::Config;
use crate::db::RecordFilter;

pub async fn cmd_ls(args: LsArgs) -> Result<()> {
    let config = Config::from_env();
    let (_db, _firewall, mapper) = build_mapper(&config)?;

    let filter = RecordFilter {
        name: args.name,
        addr: args.addr,
        component: args.component,
        conn_port: args.conn_port,
        target_port: args.target_port,
    };
    let records = mapper.lookup(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<16} {:<12} {:<20} {:<12} {}",
        "CONN", "TARGET ADDR", "TARGET PORT", "NAME", "COMPONENT", "ROUTABLE"
    );
    for record in records.values() {
        let routable = match record.routable {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        println!(
            "{:<10} {:<16} {:<12} {:<20} {:<12} {}",
            record.conn_port,
            record.target_addr,
            record.target_port,
            record.target_name,
            record.target_component,
            routable
        );
    }
    Ok(())
}
