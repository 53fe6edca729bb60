use anyhow::Result;
use clap::Parser;
use portmapd::cli::{self, Commands};
use portmapd::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Only use colors when outputting to a TTY (not when piped to a file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .init();

    let result = match cli.cmd {
        Commands::Create(args) => commands::cmd_create(args).await,
        Commands::Destroy(args) => commands::cmd_destroy(args).await,
        Commands::Show(args) => commands::cmd_show(args).await,
        Commands::Ls(args) => commands::cmd_ls(args).await,
        Commands::Addrs(args) => commands::cmd_addrs(args).await,
        Commands::Save => commands::cmd_save().await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    result
}
