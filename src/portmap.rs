//! The create/destroy saga keeping a port-mapping record and its two
//! firewall rules consistent.
//!
//! The record and the rules live in independently-failing places with no
//! shared transaction, so every multi-step operation here pairs its forward
//! actions with explicit compensations: fail at step k, undo steps k-1..1,
//! and report the original error. Compensation failures are logged, never
//! substituted for the error that triggered them.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::{AddrInfo, Database, PortRecord, RecordFilter};
use crate::error::{Error, Result, Status};
use crate::firewall::{FireWall, Table};

pub struct PortMapper {
    db: Arc<Database>,
    firewall: Arc<FireWall>,
}

impl PortMapper {
    pub fn new(db: Arc<Database>, firewall: Arc<FireWall>) -> Self {
        Self { db, firewall }
    }

    /// Create a mapping: allocate the record, then install both rules.
    ///
    /// Port collisions are retried inside the store and invisible here. A
    /// rule failure rolls the record back, so either the record and both
    /// rules exist afterwards or none of them do.
    pub async fn create(
        &self,
        target_addr: &str,
        target_port: u16,
        target_name: &str,
        target_component: &str,
    ) -> Result<u16> {
        if target_addr.parse::<Ipv4Addr>().is_err() {
            return Err(Error::InvalidArgument(format!(
                "target_addr must be an IPv4 address, supplied: {target_addr}"
            )));
        }

        let conn_port = self
            .db
            .add_port(target_addr, target_port, target_name, target_component)
            .await?;

        if let Err(err) = self
            .firewall
            .map_port(conn_port, target_port, target_addr)
            .await
        {
            // The mapping never became reachable; roll the record back.
            if let Err(undo) = self.db.delete_port(conn_port).await {
                error!(
                    conn_port,
                    %undo,
                    "failed to remove record while unwinding; record and rules now disagree"
                );
            }
            return Err(err);
        }

        info!(conn_port, target_addr, target_port, "port mapping created");
        Ok(conn_port)
    }

    /// Tear down a mapping: both rules first, the record last.
    ///
    /// The record is the source of truth and stays until the rules are
    /// confirmed gone; a crash mid-teardown leaves a record without rules,
    /// which the consistency gate reports on the next attempt instead of
    /// half-deleting further.
    pub async fn destroy(&self, conn_port: u16) -> Result<()> {
        let record = self.db.port_info(conn_port).await?;

        // One guard across the lookups and all three deletes; rule
        // positions are only meaningful while nothing else mutates the
        // tables.
        let fw = self.firewall.lock().await;

        let (nat_id, filter_id) = match &record {
            Some((target_port, target_addr)) => {
                let nat_id = match fw
                    .find_rule(*target_port, target_addr, Table::Nat, Some(conn_port))
                    .await
                {
                    Ok(id) => Some(id),
                    Err(Error::RuleNotFound { .. }) => None,
                    Err(err) => return Err(err),
                };
                let filter_id = match fw
                    .find_rule(*target_port, target_addr, Table::Filter, None)
                    .await
                {
                    Ok(id) => Some(id),
                    Err(Error::RuleNotFound { .. }) => None,
                    Err(err) => return Err(err),
                };
                (nat_id, filter_id)
            }
            None => (None, None),
        };

        let (record_port, record_addr) = match &record {
            Some((port, addr)) => (Some(*port), Some(addr.as_str())),
            None => (None, None),
        };
        let (message, status) = consistency_check(nat_id, filter_id, record_port, record_addr);
        if status != Status::Ok {
            return Err(Error::Inconsistent {
                message: message.to_string(),
                status,
            });
        }
        let (Some((target_port, target_addr)), Some(nat_id), Some(filter_id)) =
            (record, nat_id, filter_id)
        else {
            return Err(Error::Inconsistent {
                message: "port mapping state changed during teardown".to_string(),
                status: Status::ServerError,
            });
        };

        fw.delete_rule(nat_id, Table::Nat).await?;

        if let Err(err) = fw.delete_rule(filter_id, Table::Filter).await {
            // Put the forward rule back. The nat rule stays gone, so the
            // mapping is dead but the record still describes what existed.
            error!(conn_port, %err, "failed to delete forward rule; restoring it");
            if let Err(undo) = fw.forward(target_port, &target_addr).await {
                error!(%undo, "failed to restore forward rule");
            }
            if let Err(undo) = fw.save_rules().await {
                warn!(%undo, "failed to persist rules after restore");
            }
            return Err(err);
        }

        if let Err(err) = self.db.delete_port(conn_port).await {
            // Both rules are gone but the record refused to die; reinstall
            // the rules so record and tables agree again.
            error!(conn_port, %err, "failed to delete record; reinstalling rules");
            if let Err(undo) = fw.map_port(conn_port, target_port, &target_addr).await {
                error!(%undo, "failed to reinstall rules; record now has no rules");
            }
            return Err(err);
        }

        info!(conn_port, "port mapping destroyed");
        Ok(())
    }

    /// Records matching the filter, keyed by connection port.
    pub async fn lookup(&self, filter: &RecordFilter) -> Result<BTreeMap<u16, PortRecord>> {
        self.db.lookup_port(filter).await
    }

    /// Known machines and their addresses, grouped by name.
    pub async fn lookup_addrs(&self, filter: &RecordFilter) -> Result<BTreeMap<String, AddrInfo>> {
        self.db.lookup_addr(filter).await
    }
}

/// Classify agreement between the database record and the two rule
/// positions before anything is torn down. Partial rule presence with a
/// record counts as "rules missing": a half-installed mapping is already
/// inconsistent.
pub fn consistency_check(
    nat_id: Option<u32>,
    filter_id: Option<u32>,
    target_port: Option<u16>,
    target_addr: Option<&str>,
) -> (&'static str, Status) {
    let record_present = target_port.is_some() && target_addr.is_some();
    let rules_present = nat_id.is_some() && filter_id.is_some();
    match (record_present, rules_present) {
        (true, false) => (
            "DB record exist, but no iptable record; contact admin.",
            Status::ServerError,
        ),
        (false, true) => (
            "iptable record exist, but no DB record; contact admin.",
            Status::ServerError,
        ),
        (false, false) => ("No such port mapping record", Status::NotFound),
        (true, true) => ("", Status::Ok),
    }
}
