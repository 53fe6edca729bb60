//! Runtime settings, each overridable through a `PORTMAPD_*` environment
//! variable.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Inclusive lower bound of the public connection-port range.
    pub port_min: u16,
    /// Inclusive upper bound of the public connection-port range.
    pub port_max: u16,
    /// How many random draws to attempt before declaring the range saturated.
    pub insert_max_tries: u32,
    /// Interface facing the outside world; prerouting rules bind to it.
    pub external_iface: String,
    /// Where `iptables-save` output is persisted across reboots.
    pub rules_file: PathBuf,
    /// SQLite database holding the port-mapping records.
    pub database_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_min: 50000,
            port_max: 50100,
            insert_max_tries: 100,
            external_iface: "ens160".to_string(),
            rules_file: PathBuf::from("/etc/iptables/rules.v4"),
            database_path: PathBuf::from("/var/lib/portmapd/portmap.db"),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("PORTMAPD_PORT_MIN") {
            config.port_min = v;
        }
        if let Some(v) = env_parse("PORTMAPD_PORT_MAX") {
            config.port_max = v;
        }
        if let Some(v) = env_parse("PORTMAPD_INSERT_MAX_TRIES") {
            config.insert_max_tries = v;
        }
        if let Ok(v) = env::var("PORTMAPD_EXTERNAL_IFACE") {
            config.external_iface = v;
        }
        if let Ok(v) = env::var("PORTMAPD_RULES_FILE") {
            config.rules_file = PathBuf::from(v);
        }
        if let Ok(v) = env::var("PORTMAPD_DATABASE") {
            config.database_path = PathBuf::from(v);
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
