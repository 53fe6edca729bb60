use anyhow::Result;

use crate::cli::AddrsArgs;
use crate::commands::build_mapper;
use crate::config::Config;
use crate::db::RecordFilter;

pub async fn cmd_addrs(args: AddrsArgs) -> Result<()> {
    let config = Config::from_env();
    let (_db, _firewall, mapper) = build_mapper(&config)?;

    let filter = RecordFilter {
        name: args.name,
        addr: args.addr,
        component: args.component,
        ..Default::default()
    };
    let machines = mapper.lookup_addrs(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&machines)?);
        return Ok(());
    }

    println!("{:<20} {:<12} {:<8} {}", "NAME", "COMPONENT", "ROUTABLE", "ADDRS");
    for (name, info) in &machines {
        let routable = match info.routable {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        println!(
            "{:<20} {:<12} {:<8} {}",
            name,
            info.component,
            routable,
            info.addrs.join(", ")
        );
    }
    Ok(())
}
