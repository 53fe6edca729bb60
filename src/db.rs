//! Durable port-mapping records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use tokio::task;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS ipam (
    conn_port        INTEGER NOT NULL UNIQUE,
    target_addr      TEXT NOT NULL,
    target_port      INTEGER NOT NULL,
    target_name      TEXT NOT NULL,
    target_component TEXT NOT NULL,
    routable         BOOLEAN
)";

/// One persisted mapping.
#[derive(Debug, Clone, Serialize)]
pub struct PortRecord {
    pub conn_port: u16,
    pub target_addr: String,
    pub target_port: u16,
    pub target_name: String,
    pub target_component: String,
    pub routable: Option<bool>,
}

/// Grouped address view: every distinct address recorded for one machine.
#[derive(Debug, Clone, Serialize)]
pub struct AddrInfo {
    pub addrs: Vec<String>,
    pub component: String,
    pub routable: Option<bool>,
}

/// Optional conjunctive filters for the lookup queries; unset fields
/// constrain nothing.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub name: Option<String>,
    pub addr: Option<String>,
    pub component: Option<String>,
    pub conn_port: Option<u16>,
    pub target_port: Option<u16>,
}

impl RecordFilter {
    /// WHERE clause plus bind values for whichever fields are set. All
    /// clauses AND together; everything is parameterized.
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = &self.name {
            values.push(Value::from(name.clone()));
            clauses.push(format!("target_name = ?{}", values.len()));
        }
        if let Some(addr) = &self.addr {
            values.push(Value::from(addr.clone()));
            clauses.push(format!("target_addr = ?{}", values.len()));
        }
        if let Some(component) = &self.component {
            values.push(Value::from(component.clone()));
            clauses.push(format!("target_component = ?{}", values.len()));
        }
        if let Some(port) = self.conn_port {
            values.push(Value::from(i64::from(port)));
            clauses.push(format!("conn_port = ?{}", values.len()));
        }
        if let Some(port) = self.target_port {
            values.push(Value::from(i64::from(port)));
            clauses.push(format!("target_port = ?{}", values.len()));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

/// The record store. Statement failures surface as [`Error::Store`] with
/// SQLite's extended result code attached; `conn_port` uniqueness is
/// enforced by the schema, not checked up front.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    port_min: u16,
    port_max: u16,
    insert_max_tries: u32,
}

impl Database {
    pub fn open(config: &Config) -> Result<Self> {
        let conn = Connection::open(&config.database_path)?;
        Self::from_connection(conn, config)
    }

    /// Private to this process; used by tests and ephemeral runs.
    pub fn open_in_memory(config: &Config) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: &Config) -> Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            port_min: config.port_min,
            port_max: config.port_max,
            insert_max_tries: config.insert_max_tries,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| Error::Store {
                message: "connection mutex poisoned".to_string(),
                code: None,
            })?;
            f(&conn)
        })
        .await
        .map_err(|err| Error::Store {
            message: format!("database task failed: {err}"),
            code: None,
        })?
    }

    /// Run raw SQL statements. For operational tooling; the managed write
    /// paths below are what the coordinator uses.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    /// Allocate a public connection port for a new mapping.
    ///
    /// Ports are drawn uniformly at random from the configured range and
    /// the insert is simply attempted; the UNIQUE constraint rejecting a
    /// taken port is the collision check, which also holds against other
    /// writers racing for the same range. Exhausting every attempt means
    /// the range is saturated.
    pub async fn add_port(
        &self,
        target_addr: &str,
        target_port: u16,
        target_name: &str,
        target_component: &str,
    ) -> Result<u16> {
        let (min, max, tries) = (self.port_min, self.port_max, self.insert_max_tries);
        let target_addr = target_addr.to_string();
        let target_name = target_name.to_string();
        let target_component = target_component.to_string();

        self.with_conn(move |conn| {
            let mut rng = rand::thread_rng();
            for _ in 0..tries {
                let conn_port: u16 = rng.gen_range(min..=max);
                let inserted = conn.execute(
                    "INSERT INTO ipam (conn_port, target_addr, target_port, target_name, target_component) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![conn_port, target_addr, target_port, target_name, target_component],
                );
                match inserted {
                    Ok(_) => return Ok(conn_port),
                    Err(err) => {
                        let err = Error::from(err);
                        if err.is_unique_violation() {
                            debug!(conn_port, "connection port taken, drawing another");
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
            Err(Error::CapacityExhausted { tries })
        })
        .await
    }

    /// Idempotent: deleting a port that has no record is a no-op.
    pub async fn delete_port(&self, conn_port: u16) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM ipam WHERE conn_port = ?1", params![conn_port])?;
            Ok(())
        })
        .await
    }

    /// The `(target_port, target_addr)` a connection port maps to, if any.
    pub async fn port_info(&self, conn_port: u16) -> Result<Option<(u16, String)>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT target_port, target_addr FROM ipam WHERE conn_port = ?1",
                params![conn_port],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    /// All records matching the filter, keyed by connection port.
    pub async fn lookup_port(&self, filter: &RecordFilter) -> Result<BTreeMap<u16, PortRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (where_sql, values) = filter.to_sql();
            let sql = format!(
                "SELECT conn_port, target_addr, target_port, target_name, target_component, routable \
                 FROM ipam{where_sql}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
                Ok(PortRecord {
                    conn_port: row.get(0)?,
                    target_addr: row.get(1)?,
                    target_port: row.get(2)?,
                    target_name: row.get(3)?,
                    target_component: row.get(4)?,
                    routable: row.get(5)?,
                })
            })?;
            let mut records = BTreeMap::new();
            for record in rows {
                let record = record?;
                records.insert(record.conn_port, record);
            }
            Ok(records)
        })
        .await
    }

    /// Machines matching the filter, grouped by name with their distinct
    /// addresses unioned. A machine with several mapped ports on one
    /// address still lists that address once.
    pub async fn lookup_addr(&self, filter: &RecordFilter) -> Result<BTreeMap<String, AddrInfo>> {
        // Port filters make no sense for the address view.
        let filter = RecordFilter {
            name: filter.name.clone(),
            addr: filter.addr.clone(),
            component: filter.component.clone(),
            ..Default::default()
        };
        self.with_conn(move |conn| {
            let (where_sql, values) = filter.to_sql();
            let sql = format!(
                "SELECT target_name, target_addr, target_component, routable FROM ipam{where_sql}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(values))?;
            let mut grouped: BTreeMap<String, AddrInfo> = BTreeMap::new();
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let addr: String = row.get(1)?;
                let component: String = row.get(2)?;
                let routable: Option<bool> = row.get(3)?;
                let entry = grouped.entry(name).or_insert_with(|| AddrInfo {
                    addrs: Vec::new(),
                    component,
                    routable: None,
                });
                if !entry.addrs.contains(&addr) {
                    entry.addrs.push(addr);
                }
                entry.routable = merge_routable(entry.routable, routable);
            }
            Ok(grouped)
        })
        .await
    }

    /// The liveness prober's only write path; nothing else may touch
    /// `routable`.
    pub async fn set_routable(
        &self,
        target_name: &str,
        target_addr: &str,
        routable: bool,
    ) -> Result<()> {
        let name = target_name.to_string();
        let addr = target_addr.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE ipam SET routable = ?1 WHERE target_name = ?2 AND target_addr = ?3",
                params![routable, name, addr],
            )?;
            Ok(())
        })
        .await
    }
}

/// A machine is routable only if every address with a known state is.
fn merge_routable(acc: Option<bool>, next: Option<bool>) -> Option<bool> {
    match (acc, next) {
        (Some(a), Some(b)) => Some(a && b),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
