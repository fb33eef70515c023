//! Deployment configuration, loaded from TOML.
//!
//! `sug0-bafomet` has no file-based configuration layer of its own (its
//! `NodeConfig` is built in-process by the embedding binary); this module is
//! drawn from the wider example pack, in the shape of
//! `swedishembedded-sven`'s `sven-config` crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mesh::codec::payload::PayloadCodecKind;
use crate::mesh::error::{Error, Result};

pub const DEFAULT_COORDINATOR_PORT: u16 = 6374;
pub const DEFAULT_CHALLENGE_LEN: usize = 32;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TCP_PORT_SCAN_START: u16 = 49152;
pub const DEFAULT_TCP_PORT_SCAN_END: u16 = 65535;
pub const DEFAULT_OUTBOX_TTL_SECS: u64 = 5;
pub const DEFAULT_OUTBOX_MAXSIZE: usize = 100;
pub const DEFAULT_LISTENER_QUEUE_MAXSIZE: usize = 10;
pub const DEFAULT_MAX_REQUEST_IDS: usize = 256;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 15;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node_name: String,
    pub hostname: Option<String>,

    pub coordinator_host: String,
    pub coordinator_port: u16,

    /// `None` disables authentication (no-op authenticator).
    #[serde(with = "authkey_hex")]
    pub authkey: Option<Vec<u8>>,
    pub challenge_len: usize,
    pub auth_timeout_secs: u64,

    pub tcp_port: Option<u16>,
    pub tcp_port_scan_start: u16,
    pub tcp_port_scan_end: u16,
    pub enable_unix_socket: bool,

    pub outbox_ttl_secs: u64,
    pub outbox_maxsize: usize,

    pub listener_queue_maxsize: usize,
    pub max_request_ids: usize,

    pub payload_codec: PayloadCodecKind,

    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub log_heartbeats: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            node_name: "node".to_string(),
            hostname: None,
            coordinator_host: "localhost".to_string(),
            coordinator_port: DEFAULT_COORDINATOR_PORT,
            authkey: None,
            challenge_len: DEFAULT_CHALLENGE_LEN,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            tcp_port: None,
            tcp_port_scan_start: DEFAULT_TCP_PORT_SCAN_START,
            tcp_port_scan_end: DEFAULT_TCP_PORT_SCAN_END,
            enable_unix_socket: true,
            outbox_ttl_secs: DEFAULT_OUTBOX_TTL_SECS,
            outbox_maxsize: DEFAULT_OUTBOX_MAXSIZE,
            listener_queue_maxsize: DEFAULT_LISTENER_QUEUE_MAXSIZE,
            max_request_ids: DEFAULT_MAX_REQUEST_IDS,
            payload_codec: PayloadCodecKind::Json,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            log_heartbeats: false,
        }
    }
}

impl MeshConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MeshConfig = toml::from_str(s)
            .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Configuration, "invalid configuration toml", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.authkey {
            if key.is_empty() {
                return Err(Error::configuration(
                    "authkey must be non-empty when present; omit it to disable authentication",
                ));
            }
        }
        if self.tcp_port_scan_start > self.tcp_port_scan_end {
            return Err(Error::configuration(
                "tcp_port_scan_start must be <= tcp_port_scan_end",
            ));
        }
        if self.outbox_maxsize == 0 {
            return Err(Error::configuration("outbox_maxsize must be positive"));
        }
        if self.listener_queue_maxsize == 0 {
            return Err(Error::configuration(
                "listener_queue_maxsize must be positive",
            ));
        }
        if self.max_request_ids == 0 {
            return Err(Error::configuration("max_request_ids must be positive"));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn outbox_ttl(&self) -> Duration {
        Duration::from_secs(self.outbox_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

mod authkey_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&hex_encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| hex_decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("authkey hex string must have even length".to_string());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }
}
