// Common test utilities for portmapd integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use portmapd::config::Config;
use portmapd::db::Database;
use portmapd::error::{Error, Result};
use portmapd::firewall::FireWall;
use portmapd::portmap::PortMapper;
use portmapd::shell::CommandRunner;

/// In-memory stand-in for the host's iptables.
///
/// Keeps both rule tables, renders listings in the real tool's column
/// layout (including the filter chain's two built-in rules), records every
/// invocation, and can be told to fail commands matching a substring.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    nat: Vec<NatRule>,
    filter: Vec<FilterRule>,
    fail_patterns: Vec<String>,
    calls: Vec<String>,
}

#[derive(Clone)]
struct NatRule {
    conn_port: u16,
    addr: String,
    port: u16,
}

#[derive(Clone)]
struct FilterRule {
    addr: String,
    port: u16,
}

// The filter FORWARD chain always starts with the gateway's LOG and
// blanket ACCEPT rules, so appended rules land at position 3 onwards.
const FILTER_BUILTINS: usize = 2;

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent command whose argv contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_patterns
            .push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_patterns.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// `(conn_port, target_addr, target_port)` per nat rule, listing order.
    pub fn nat_rules(&self) -> Vec<(u16, String, u16)> {
        self.state
            .lock()
            .unwrap()
            .nat
            .iter()
            .map(|r| (r.conn_port, r.addr.clone(), r.port))
            .collect()
    }

    /// `(target_addr, target_port)` per appended filter rule, listing order.
    pub fn filter_rules(&self) -> Vec<(String, u16)> {
        self.state
            .lock()
            .unwrap()
            .filter
            .iter()
            .map(|r| (r.addr.clone(), r.port))
            .collect()
    }

    /// Wipe both tables, simulating rules lost outside our control.
    pub fn clear_tables(&self) {
        let mut state = self.state.lock().unwrap();
        state.nat.clear();
        state.filter.clear();
    }

    fn render_nat(state: &FakeState) -> String {
        let mut out = String::from(
            "Chain PREROUTING (policy ACCEPT)\n\
             num  target     prot opt source               destination\n",
        );
        for (idx, rule) in state.nat.iter().enumerate() {
            out.push_str(&format!(
                "{}    DNAT       tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:{} to:{}:{}\n",
                idx + 1,
                rule.conn_port,
                rule.addr,
                rule.port
            ));
        }
        out
    }

    fn render_filter(state: &FakeState) -> String {
        let mut out = String::from(
            "Chain FORWARD (policy ACCEPT)\n\
             num  target     prot opt source               destination\n\
             1    LOG        all  --  0.0.0.0/0            0.0.0.0/0            LOG flags 0 level 4\n\
             2    ACCEPT     all  --  0.0.0.0/0            0.0.0.0/0\n",
        );
        for (idx, rule) in state.filter.iter().enumerate() {
            out.push_str(&format!(
                "{}    ACCEPT     tcp  --  0.0.0.0/0            {}          tcp dpt:{}\n",
                idx + 1 + FILTER_BUILTINS,
                rule.addr,
                rule.port
            ));
        }
        out
    }

    fn render_save(state: &FakeState) -> String {
        // Loose approximation of iptables-save; the firewall layer treats
        // it as opaque text.
        let mut out = String::from("*filter\n");
        for rule in &state.filter {
            out.push_str(&format!(
                "-A FORWARD -d {} -p tcp --dport {} -j ACCEPT\n",
                rule.addr, rule.port
            ));
        }
        out.push_str("*nat\n");
        for rule in &state.nat {
            out.push_str(&format!(
                "-A PREROUTING -p tcp --dport {} -j DNAT --to-destination {}:{}\n",
                rule.conn_port, rule.addr, rule.port
            ));
        }
        out
    }

    fn cli_error(command: &str, stderr: &str) -> Error {
        Error::Cli {
            command: command.to_string(),
            status: 1,
            stderr: stderr.to_string(),
        }
    }

    fn token_after(argv: &[String], flag: &str) -> Option<String> {
        argv.iter()
            .position(|t| t == flag)
            .and_then(|i| argv.get(i + 1))
            .cloned()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        let command = argv.join(" ");
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());

        if state
            .fail_patterns
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
        {
            return Err(Self::cli_error(&command, "injected failure"));
        }

        if argv.first().map(String::as_str) == Some("iptables-save") {
            return Ok(Self::render_save(&state));
        }

        if command.contains("-A FORWARD") {
            let addr = Self::token_after(argv, "-d")
                .ok_or_else(|| Self::cli_error(&command, "missing -d"))?;
            let port = Self::token_after(argv, "--dport")
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Self::cli_error(&command, "bad --dport"))?;
            state.filter.push(FilterRule { addr, port });
            return Ok(String::new());
        }

        if command.contains("-A PREROUTING") {
            let conn_port = Self::token_after(argv, "--dport")
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Self::cli_error(&command, "bad --dport"))?;
            let to = Self::token_after(argv, "--to")
                .ok_or_else(|| Self::cli_error(&command, "missing --to"))?;
            let (addr, port) = to
                .rsplit_once(':')
                .and_then(|(a, p)| p.parse().ok().map(|p| (a.to_string(), p)))
                .ok_or_else(|| Self::cli_error(&command, "bad --to"))?;
            state.nat.push(NatRule {
                conn_port,
                addr,
                port,
            });
            return Ok(String::new());
        }

        if command.contains("-D PREROUTING") {
            let position: usize = argv
                .last()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Self::cli_error(&command, "bad position"))?;
            if position == 0 || position > state.nat.len() {
                return Err(Self::cli_error(&command, "Index of deletion too big"));
            }
            state.nat.remove(position - 1);
            return Ok(String::new());
        }

        if command.contains("-D FORWARD") {
            let position: usize = argv
                .last()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Self::cli_error(&command, "bad position"))?;
            if position <= FILTER_BUILTINS || position > state.filter.len() + FILTER_BUILTINS {
                return Err(Self::cli_error(&command, "Index of deletion too big"));
            }
            state.filter.remove(position - 1 - FILTER_BUILTINS);
            return Ok(String::new());
        }

        if command.contains("-L PREROUTING") {
            return Ok(Self::render_nat(&state));
        }

        if command.contains("-L FORWARD") {
            return Ok(Self::render_filter(&state));
        }

        Err(Self::cli_error(&command, "unrecognized command"))
    }
}

/// Everything a saga test needs, wired the way the binary wires it but with
/// the fake runner and an in-memory database.
pub struct TestStack {
    pub runner: Arc<FakeRunner>,
    pub db: Arc<Database>,
    pub firewall: Arc<FireWall>,
    pub mapper: PortMapper,
    pub config: Config,
    tmp: TempDir,
}

impl TestStack {
    pub fn rules_file_contents(&self) -> Option<String> {
        std::fs::read_to_string(&self.config.rules_file).ok()
    }
}

pub fn stack() -> TestStack {
    let tmp = TempDir::new().expect("creating tempdir");
    let config = Config {
        port_min: 50000,
        port_max: 50100,
        insert_max_tries: 100,
        external_iface: "ens160".to_string(),
        rules_file: tmp.path().join("rules.v4"),
        database_path: tmp.path().join("unused.db"),
    };
    let runner = Arc::new(FakeRunner::new());
    let db = Arc::new(Database::open_in_memory(&config).expect("opening in-memory database"));
    let firewall = Arc::new(FireWall::new(
        Arc::clone(&runner) as Arc<dyn CommandRunner>,
        &config,
    ));
    let mapper = PortMapper::new(Arc::clone(&db), Arc::clone(&firewall));
    TestStack {
        runner,
        db,
        firewall,
        mapper,
        config,
        tmp,
    }
}
