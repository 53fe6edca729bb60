//! External command invocation.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Seam between the firewall layer and the host's netfilter tooling.
///
/// The production implementation spawns the real commands; tests substitute
/// a scripted fake so rule-table behavior can be driven without root.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, returning captured stdout. A non-zero exit is an
    /// [`Error::Cli`] carrying the captured stderr.
    async fn run(&self, argv: &[String]) -> Result<String>;

    /// Convenience wrapper splitting a flat command line on whitespace.
    async fn run_str(&self, cmd: &str) -> Result<String> {
        let argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
        self.run(&argv).await
    }
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty command line".to_string()))?;

        debug!(command = %argv.join(" "), "running");
        let output = Command::new(program).args(args).output().await?;

        if !output.status.success() {
            return Err(Error::Cli {
                command: argv.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
