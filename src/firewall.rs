//! The live netfilter rule tables: the nat PREROUTING chain and the filter
//! FORWARD chain.
//!
//! Rules are addressed by their 1-based position in a chain, and position-
//! based deletion is only safe when nothing else mutates the table between
//! the listing and the delete. Every operation therefore goes through one
//! process-wide lock: compound sequences hold the guard across all their
//! sub-calls via [`FireWall::lock`], while the standalone wrappers acquire
//! it per call. Reads take the guard too so a listing never observes a
//! table mid-mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::shell::CommandRunner;

/// The two rule tables this tool manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    /// The chain holding our rules within the table.
    pub fn chain(self) -> &'static str {
        match self {
            Table::Nat => "PREROUTING",
            Table::Filter => "FORWARD",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Nat => write!(f, "nat"),
            Table::Filter => write!(f, "filter"),
        }
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nat" => Ok(Table::Nat),
            "filter" => Ok(Table::Filter),
            other => Err(Error::InvalidArgument(format!(
                "table must be either \"nat\" or \"filter\", supplied: {other}"
            ))),
        }
    }
}

/// One parsed rule. `conn_port` is only present for nat-table rules; a
/// forward rule carries no public port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub target_addr: String,
    pub target_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_port: Option<u16>,
}

/// Serialized access to the rule tables.
pub struct FireWall {
    ops: Mutex<FirewallOps>,
}

impl FireWall {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            ops: Mutex::new(FirewallOps {
                runner,
                iface: config.external_iface.clone(),
                rules_file: config.rules_file.clone(),
            }),
        }
    }

    /// Hold the table lock across several operations, e.g. the lookups and
    /// deletes of a teardown. Sub-calls go through the returned guard.
    pub async fn lock(&self) -> MutexGuard<'_, FirewallOps> {
        self.ops.lock().await
    }

    pub async fn map_port(
        &self,
        conn_port: u16,
        target_port: u16,
        target_addr: &str,
    ) -> Result<(u32, u32)> {
        self.lock()
            .await
            .map_port(conn_port, target_port, target_addr)
            .await
    }

    pub async fn forward(&self, target_port: u16, target_addr: &str) -> Result<u32> {
        self.lock().await.forward(target_port, target_addr).await
    }

    pub async fn prerouting(
        &self,
        conn_port: u16,
        target_port: u16,
        target_addr: &str,
    ) -> Result<u32> {
        self.lock()
            .await
            .prerouting(conn_port, target_port, target_addr)
            .await
    }

    pub async fn find_rule(
        &self,
        target_port: u16,
        target_addr: &str,
        table: Table,
        conn_port: Option<u16>,
    ) -> Result<u32> {
        self.lock()
            .await
            .find_rule(target_port, target_addr, table, conn_port)
            .await
    }

    pub async fn delete_rule(&self, rule_id: u32, table: Table) -> Result<()> {
        self.lock().await.delete_rule(rule_id, table).await
    }

    pub async fn show(&self, table: Table) -> Result<BTreeMap<u32, FirewallRule>> {
        self.lock().await.show(table).await
    }

    pub async fn show_raw(&self, table: Table) -> Result<String> {
        self.lock().await.show_raw(table).await
    }

    pub async fn save_rules(&self) -> Result<()> {
        self.lock().await.save_rules().await
    }
}

/// The guard-free operations, reachable only through [`FireWall`].
pub struct FirewallOps {
    runner: Arc<dyn CommandRunner>,
    iface: String,
    rules_file: PathBuf,
}

impl FirewallOps {
    /// Create both rules for one mapping: the FORWARD accept first, then
    /// the nat DNAT.
    ///
    /// The ordering matters. A forward rule without its DNAT leaves traffic
    /// blocked, so a failure (or crash) between the two steps never exposes
    /// untranslated traffic. If the prerouting step fails, the fresh
    /// forward rule is removed best-effort and the original error is the
    /// one reported.
    pub async fn map_port(
        &self,
        conn_port: u16,
        target_port: u16,
        target_addr: &str,
    ) -> Result<(u32, u32)> {
        let forward_id = self.forward(target_port, target_addr).await?;
        let prerouting_id = match self.prerouting(conn_port, target_port, target_addr).await {
            Ok(id) => id,
            Err(err) => {
                if let Err(undo) = self.delete_rule(forward_id, Table::Filter).await {
                    warn!(%undo, "failed to remove forward rule while unwinding");
                }
                return Err(err);
            }
        };
        self.save_rules().await?;
        Ok((forward_id, prerouting_id))
    }

    /// Append the FORWARD accept rule and return its assigned position.
    pub async fn forward(&self, target_port: u16, target_addr: &str) -> Result<u32> {
        let cmd =
            format!("iptables -A FORWARD -p tcp -d {target_addr} --dport {target_port} -j ACCEPT");
        self.runner.run_str(&cmd).await?;
        // Re-list to discover the position the kernel assigned. Not finding
        // the rule we just appended means the tooling output changed under us.
        self.find_rule(target_port, target_addr, Table::Filter, None)
            .await
            .map_err(|err| {
                warn!(target_addr, target_port, "newly created FORWARD rule not found in listing");
                err
            })
    }

    /// Append the nat DNAT rule on the external interface and return its
    /// assigned position.
    pub async fn prerouting(
        &self,
        conn_port: u16,
        target_port: u16,
        target_addr: &str,
    ) -> Result<u32> {
        let cmd = format!(
            "iptables -A PREROUTING -t nat -i {} -p tcp --dport {} -j DNAT --to {}:{}",
            self.iface, conn_port, target_addr, target_port
        );
        self.runner.run_str(&cmd).await?;
        self.find_rule(target_port, target_addr, Table::Nat, Some(conn_port))
            .await
            .map_err(|err| {
                warn!(
                    conn_port,
                    target_addr, target_port, "newly created PREROUTING rule not found in listing"
                );
                err
            })
    }

    /// Position of the first rule matching the target. Nat-table lookups
    /// additionally match on `conn_port`, which is mandatory there: the nat
    /// table does not disambiguate by target alone.
    pub async fn find_rule(
        &self,
        target_port: u16,
        target_addr: &str,
        table: Table,
        conn_port: Option<u16>,
    ) -> Result<u32> {
        if table == Table::Nat && conn_port.is_none() {
            return Err(Error::InvalidArgument(
                "conn_port is required when looking up nat rules".to_string(),
            ));
        }
        let rules = self.show(table).await?;
        let mut matches = rules.iter().filter(|(_, rule)| {
            rule.target_addr == target_addr
                && rule.target_port == target_port
                && rule.conn_port == conn_port
        });
        let first = matches.next();
        if table == Table::Filter && matches.next().is_some() {
            // Two mappings to the same target cannot be told apart here.
            warn!(
                target_addr,
                target_port, "multiple forward rules match the target; using the first"
            );
        }
        match first {
            Some((rule_id, _)) => Ok(*rule_id),
            None => Err(Error::RuleNotFound {
                table: table.to_string(),
                target: format!("{target_addr}:{target_port}"),
            }),
        }
    }

    /// Remove a rule by its 1-based position in the table's chain.
    pub async fn delete_rule(&self, rule_id: u32, table: Table) -> Result<()> {
        let cmd = format!("iptables -t {} -D {} {}", table, table.chain(), rule_id);
        self.runner.run_str(&cmd).await?;
        debug!(rule_id, table = %table, "rule deleted");
        Ok(())
    }

    /// List and parse a table. Built-in policy rows never carry a tcp
    /// `dpt:` match, so they fall out of the parse.
    pub async fn show(&self, table: Table) -> Result<BTreeMap<u32, FirewallRule>> {
        let raw = self.show_raw(table).await?;
        Ok(match table {
            Table::Nat => parse_nat_listing(&raw),
            Table::Filter => parse_filter_listing(&raw),
        })
    }

    /// The unparsed listing, as the kernel tooling prints it.
    pub async fn show_raw(&self, table: Table) -> Result<String> {
        let cmd = format!(
            "iptables --numeric -L {} -t {} --line-numbers",
            table.chain(),
            table
        );
        self.runner.run_str(&cmd).await
    }

    /// Persist the in-kernel rules so they survive a reboot.
    pub async fn save_rules(&self) -> Result<()> {
        let saved = self.runner.run_str("iptables-save").await?;
        tokio::fs::write(&self.rules_file, saved).await?;
        Ok(())
    }
}

/// Parse `iptables --numeric -L PREROUTING -t nat --line-numbers` output:
///
/// ```text
/// Chain PREROUTING (policy ACCEPT)
/// num  target     prot opt source               destination
/// 1    DNAT       tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:6000 to:192.168.1.2:22
/// ```
fn parse_nat_listing(output: &str) -> BTreeMap<u32, FirewallRule> {
    let mut rules = BTreeMap::new();
    for line in output.lines().skip(2) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 4 {
            continue;
        }
        let Ok(position) = columns[0].parse::<u32>() else {
            continue;
        };
        let Some(conn_port) = columns[columns.len() - 2]
            .strip_prefix("dpt:")
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(target) = columns[columns.len() - 1].strip_prefix("to:") else {
            continue;
        };
        let Some((addr, port)) = target.rsplit_once(':') else {
            continue;
        };
        let Ok(target_port) = port.parse::<u16>() else {
            continue;
        };
        rules.insert(
            position,
            FirewallRule {
                target_addr: addr.to_string(),
                target_port,
                conn_port: Some(conn_port),
            },
        );
    }
    rules
}

/// Parse `iptables --numeric -L FORWARD -t filter --line-numbers` output:
///
/// ```text
/// Chain FORWARD (policy ACCEPT)
/// num  target     prot opt source               destination
/// 1    LOG        all  --  0.0.0.0/0            0.0.0.0/0            LOG flags 0 level 4
/// 2    ACCEPT     all  --  0.0.0.0/0            0.0.0.0/0
/// 3    ACCEPT     tcp  --  0.0.0.0/0            192.168.1.2          tcp dpt:22
/// ```
///
/// The built-in LOG and blanket ACCEPT rows match all protocols and carry
/// no `dpt:`, which is what excludes them.
fn parse_filter_listing(output: &str) -> BTreeMap<u32, FirewallRule> {
    let mut rules = BTreeMap::new();
    for line in output.lines().skip(2) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 8 {
            continue;
        }
        let Ok(position) = columns[0].parse::<u32>() else {
            continue;
        };
        if columns[2] != "tcp" {
            continue;
        }
        let Some(target_port) = columns[7]
            .strip_prefix("dpt:")
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        rules.insert(
            position,
            FirewallRule {
                target_addr: columns[5].to_string(),
                target_port,
                conn_port: None,
            },
        );
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAT_LISTING: &str = "\
Chain PREROUTING (policy ACCEPT)
num  target     prot opt source               destination
1    DNAT       tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:6000 to:192.168.1.2:22
";

    const FILTER_LISTING: &str = "\
Chain FORWARD (policy ACCEPT)
num  target     prot opt source               destination
1    LOG        all  --  0.0.0.0/0            0.0.0.0/0            LOG flags 0 level 4
2    ACCEPT     all  --  0.0.0.0/0            0.0.0.0/0
3    ACCEPT     tcp  --  0.0.0.0/0            192.168.1.2          tcp dpt:22
";

    #[test]
    fn test_parse_nat_listing() {
        let rules = parse_nat_listing(NAT_LISTING);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[&1],
            FirewallRule {
                target_addr: "192.168.1.2".to_string(),
                target_port: 22,
                conn_port: Some(6000),
            }
        );
    }

    #[test]
    fn test_parse_filter_listing_skips_builtins() {
        let rules = parse_filter_listing(FILTER_LISTING);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[&3],
            FirewallRule {
                target_addr: "192.168.1.2".to_string(),
                target_port: 22,
                conn_port: None,
            }
        );
    }

    #[test]
    fn test_parse_empty_chain() {
        let output = "\
Chain PREROUTING (policy ACCEPT)
num  target     prot opt source               destination
";
        assert!(parse_nat_listing(output).is_empty());
        assert!(parse_filter_listing(output).is_empty());
    }

    #[test]
    fn test_parse_garbage_rows_are_skipped() {
        let output = "\
Chain FORWARD (policy ACCEPT)
num  target     prot opt source               destination
3    ACCEPT     tcp  --  0.0.0.0/0            192.168.1.2          tcp dpt:not-a-port
4    ACCEPT     tcp  --  0.0.0.0/0            192.168.1.3          tcp dpt:8080
";
        let rules = parse_filter_listing(output);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[&4].target_port, 8080);
    }

    #[test]
    fn test_table_from_str() {
        assert_eq!("nat".parse::<Table>().unwrap(), Table::Nat);
        assert_eq!("FILTER".parse::<Table>().unwrap(), Table::Filter);
        assert!(matches!(
            "mangle".parse::<Table>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_table_chain_names() {
        assert_eq!(Table::Nat.chain(), "PREROUTING");
        assert_eq!(Table::Filter.chain(), "FORWARD");
        assert_eq!(Table::Nat.to_string(), "nat");
        assert_eq!(Table::Filter.to_string(), "filter");
    }
}
