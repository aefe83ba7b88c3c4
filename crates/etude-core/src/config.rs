//! Key/value configuration.
//!
//! The file format is line based:
//!
//! ```text
//! ; comment
//! [Socket]
//! ListenPortCount = 1
//! ListenPort0 = 9000
//! worker_connections = 1024
//! ```
//!
//! Lines starting with `;`, `#`, a space or a tab are comments, `[section]`
//! headers are ignored, and keys are matched case-insensitively. Any key can
//! be overridden from the environment as `<PREFIX><KEY>` in upper case,
//! e.g. `ETUDE_WORKER_CONNECTIONS=4096`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::accept::Admission;
use crate::error::{EngineError, EngineResult};
use crate::packet::{MAX_PACKET_LEN, PKG_HEADER_LEN};

/// Environment prefix used by [`Config::apply_env_overrides`] in the server.
pub const ENV_PREFIX: &str = "ETUDE_";

#[derive(Debug, Clone, Default)]
pub struct Config {
    items: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with([';', '#', ' ', '\t', '[']) {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            config.set(key, value.trim());
        }
        config
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.items.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.items.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Integer value of `key`, or `default` when missing or not a number.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get_string(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, value = raw, default, "not an integer, using default");
                default
            }),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_int(key, default as i64) != 0
    }

    /// Overlay variables named `<prefix><KEY>` from the process environment.
    pub fn apply_env_overrides(&mut self, prefix: &str) {
        self.apply_overrides(prefix, std::env::vars());
    }

    fn apply_overrides(&mut self, prefix: &str, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(prefix) {
                if !key.is_empty() {
                    self.set(key, value.trim());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Typed engine settings read from a [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_host: String,
    pub listen_ports: Vec<u16>,
    pub worker_connections: usize,
    pub pool_elastic: bool,
    pub worker_threads: usize,
    pub recycle_wait: Duration,
    pub heartbeat_enabled: bool,
    pub heartbeat_wait: Duration,
    pub heartbeat_grace: Duration,
    pub timeout_kick: bool,
    pub flood_enabled: bool,
    pub flood_interval: Duration,
    pub flood_kick_count: u32,
    pub admission_pool_multiple: usize,
    pub admission_free_floor: usize,
    pub max_send_queue: usize,
    pub max_conn_send_queue: usize,
    pub max_packet_len: usize,
    pub poll_timeout: Duration,
    pub diagnostics_interval: Option<Duration>,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_ports: vec![9000],
            worker_connections: 1024,
            pool_elastic: true,
            worker_threads: num_cpus::get(),
            recycle_wait: Duration::from_secs(60),
            heartbeat_enabled: false,
            heartbeat_wait: Duration::from_secs(20),
            heartbeat_grace: Duration::from_secs(10),
            timeout_kick: false,
            flood_enabled: true,
            flood_interval: Duration::from_millis(100),
            flood_kick_count: 10,
            admission_pool_multiple: 5,
            admission_free_floor: 1024,
            max_send_queue: 50_000,
            max_conn_send_queue: 400,
            max_packet_len: MAX_PACKET_LEN,
            poll_timeout: Duration::from_millis(500),
            diagnostics_interval: Some(Duration::from_secs(10)),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> EngineResult<Self> {
        let d = Self::default();

        let port_count = config.get_int("ListenPortCount", 1);
        if port_count < 1 {
            return Err(EngineError::Config(format!("ListenPortCount must be at least 1, got {}", port_count)));
        }
        let mut listen_ports = Vec::with_capacity(port_count as usize);
        for i in 0..port_count {
            let key = format!("ListenPort{}", i);
            let raw = config.get_int(&key, 9000 + i);
            let port = u16::try_from(raw).map_err(|_| EngineError::Config(format!("{} out of range: {}", key, raw)))?;
            listen_ports.push(port);
        }

        let worker_connections = positive(config, "worker_connections", d.worker_connections);

        Ok(Self {
            listen_host: config.get_string("ListenHost").unwrap_or(d.listen_host.as_str()).to_string(),
            listen_ports,
            worker_connections,
            pool_elastic: config.get_bool("Sock_PoolElastic", d.pool_elastic),
            worker_threads: positive(config, "ProcMsgRecvWorkThreadCount", d.worker_threads),
            recycle_wait: secs(config, "Sock_RecyConnectionWaitTime", d.recycle_wait),
            heartbeat_enabled: config.get_bool("Sock_WaitTimeEnable", d.heartbeat_enabled),
            heartbeat_wait: secs(config, "Sock_MaxWaitTime", d.heartbeat_wait).max(Duration::from_secs(1)),
            heartbeat_grace: secs(config, "Sock_HeartbeatGrace", d.heartbeat_grace),
            timeout_kick: config.get_bool("Sock_TimeOutKick", d.timeout_kick),
            flood_enabled: config.get_bool("Sock_FloodAttackKickEnable", d.flood_enabled),
            flood_interval: millis(config, "Sock_FloodTimeInterval", d.flood_interval),
            flood_kick_count: positive(config, "Sock_FloodKickCounter", d.flood_kick_count as usize) as u32,
            admission_pool_multiple: positive(config, "Sock_AdmissionPoolMultiple", d.admission_pool_multiple),
            admission_free_floor: non_negative(config, "Sock_AdmissionFreeFloor", worker_connections),
            max_send_queue: positive(config, "Sock_MaxSendQueue", d.max_send_queue),
            max_conn_send_queue: positive(config, "Sock_MaxConnSendQueue", d.max_conn_send_queue),
            max_packet_len: non_negative(config, "Sock_MaxPacketLength", d.max_packet_len)
                .clamp(PKG_HEADER_LEN, u16::MAX as usize),
            poll_timeout: millis(config, "Sock_PollTimeout", d.poll_timeout),
            diagnostics_interval: Some(secs(config, "Sock_DiagnosticsInterval", Duration::from_secs(10)))
                .filter(|i| !i.is_zero()),
            log_level: config.get_string("LogLevel").unwrap_or(d.log_level.as_str()).to_string(),
        })
    }

    pub fn admission(&self) -> Admission {
        Admission {
            max_online: self.worker_connections,
            pool_multiple: self.admission_pool_multiple,
            free_floor: self.admission_free_floor,
        }
    }
}

fn non_negative(config: &Config, key: &str, default: usize) -> usize {
    usize::try_from(config.get_int(key, default as i64)).unwrap_or(default)
}

fn positive(config: &Config, key: &str, default: usize) -> usize {
    match non_negative(config, key, default) {
        0 => default,
        n => n,
    }
}

fn secs(config: &Config, key: &str, default: Duration) -> Duration {
    Duration::from_secs(non_negative(config, key, default.as_secs() as usize) as u64)
}

fn millis(config: &Config, key: &str, default: Duration) -> Duration {
    Duration::from_millis(non_negative(config, key, default.as_millis() as usize) as u64)
}
