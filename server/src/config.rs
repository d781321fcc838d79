//! Server configuration.
//!
//! Plain-text `key = value` file, UTF-8, one entry per line, `#` starts a
//! comment, surrounding whitespace is trimmed. Unknown keys are ignored so
//! deployments can carry extra annotations.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Default worker-loop count when the config does not say otherwise.
const DEFAULT_WORKERS: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    #[error("missing required config key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid value '{value}' for config key '{key}'")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the log file is written to.
    pub log_file_dir: PathBuf,
    /// Log file name inside `log_file_dir`.
    pub log_file_name: String,
    /// Directory holding the digest-keyed file store.
    pub file_cache_dir: PathBuf,
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    /// Worker event loops.
    pub workers: usize,
    /// Set `SO_REUSEPORT` on the listener.
    pub reuse_port: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = match line.split_once('#') {
                Some((before, _comment)) => before,
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    entries.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => tracing::warn!("ignoring malformed config line: {line}"),
            }
        }

        let listen_ip = required(&entries, "listenip")?;
        let listen_ip: IpAddr = listen_ip
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "listenip",
                value: listen_ip.to_string(),
            })?;
        let listen_port = required(&entries, "listenport")?;
        let listen_port: u16 = listen_port
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "listenport",
                value: listen_port.to_string(),
            })?;

        let workers = match entries.get("workers") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "workers",
                value: raw.clone(),
            })?,
            None => DEFAULT_WORKERS,
        };
        let reuse_port = match entries.get("reuseport") {
            Some(raw) => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "reuseport",
                        value: raw.clone(),
                    });
                }
            },
            None => false,
        };

        Ok(Config {
            log_file_dir: PathBuf::from(required(&entries, "logfiledir")?),
            log_file_name: required(&entries, "logfilename")?.to_string(),
            file_cache_dir: PathBuf::from(required(&entries, "filecachedir")?),
            listen_ip,
            listen_port,
            workers,
            reuse_port,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }
}

fn required<'a>(
    entries: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    entries
        .get(key)
        .map(|s| s.as_str())
        .ok_or(ConfigError::MissingKey(key))
}

/// Sample configuration for `--print-config`.
pub const SAMPLE_CONFIG: &str = r#"# ingot server configuration

# Directory and file name for the server log
logfiledir = /var/log/ingot/
logfilename = ingot.log

# Directory holding the digest-keyed file store (created if absent)
filecachedir = /var/cache/ingot/

# Listen address
listenip = 0.0.0.0
listenport = 9000

# Worker event loops (default: 6)
# workers = 6

# Share the listen port across processes via SO_REUSEPORT
# reuseport = false
"#;
