// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::net::{parse_sockaddr, Ipv4Net, BGP_PORT};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Peer configuration in YAML config file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PeerConfig {
    pub address: String,
    pub remote_asn: u16,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides the global hold time for this peer.
    #[serde(default)]
    pub hold_time_secs: Option<u64>,
    /// Overrides the global connect retry time for this peer.
    #[serde(default)]
    pub connect_retry_secs: Option<u64>,
    /// Wait for the peer to connect instead of dialing out.
    #[serde(default)]
    pub passive_mode: bool,
    #[serde(default)]
    pub route_reflector_client: bool,
}

fn default_port() -> u16 {
    BGP_PORT
}

impl PeerConfig {
    pub fn new(address: &str, remote_asn: u16) -> Self {
        PeerConfig {
            address: address.to_string(),
            remote_asn,
            ..Default::default()
        }
    }

    pub fn ip(&self) -> Result<IpAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad peer address {:?}", self.address)))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.ip()?, self.port))
    }

    pub fn validate(&self) -> Result<IpAddr, ConfigError> {
        let ip = self.ip()?;
        if self.remote_asn == 0 {
            return Err(ConfigError::Invalid(format!("peer {} has no remote_asn", ip)));
        }
        if let Some(hold) = self.hold_time_secs {
            check_hold_time(hold)?;
        }
        Ok(ip)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            remote_asn: 0,
            port: default_port(),
            hold_time_secs: None,
            connect_retry_secs: None,
            passive_mode: false,
            route_reflector_client: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub asn: u16,
    pub router_id: Ipv4Addr,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Accept inbound BGP connections.
    #[serde(default = "default_listen")]
    pub listen: bool,
    #[serde(default = "default_hold_time")]
    pub hold_time_secs: u64,
    #[serde(default = "default_connect_retry_time")]
    pub connect_retry_secs: u64,
    /// Lower bound on the keepalive interval derived from the hold time.
    #[serde(default = "default_min_keepalive")]
    pub min_keepalive_secs: u64,
    /// Compare MED between paths from different neighbor ASes.
    #[serde(default)]
    pub always_compare_med: bool,
    #[serde(default)]
    pub route_reflector: bool,
    /// IGP metric to reach each next hop. Unlisted next hops cost 0.
    #[serde(default)]
    pub igp_costs: HashMap<Ipv4Addr, u32>,
    /// Prefixes originated by this speaker.
    #[serde(default)]
    pub networks: Vec<Ipv4Net>,
    /// Log level: "error", "warn", "info" (default), "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "text" (default) or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", BGP_PORT)
}

fn default_listen() -> bool {
    true
}

fn default_hold_time() -> u64 {
    180
}

fn default_connect_retry_time() -> u64 {
    30 // RFC suggests 120s, but 30s is more practical
}

fn default_min_keepalive() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn new(asn: u16, listen_addr: &str, router_id: Ipv4Addr, hold_time_secs: u64) -> Self {
        Config {
            asn,
            listen_addr: listen_addr.to_string(),
            router_id,
            hold_time_secs,
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.router_id.is_unspecified() {
            return Err(ConfigError::Invalid("router_id must not be 0.0.0.0".into()));
        }
        if self.asn == 0 {
            return Err(ConfigError::Invalid("asn must not be 0".into()));
        }
        check_hold_time(self.hold_time_secs)?;
        parse_sockaddr(&self.listen_addr, BGP_PORT).map_err(ConfigError::Invalid)?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            let ip = peer.validate()?;
            if !seen.insert(ip) {
                return Err(ConfigError::Invalid(format!("duplicate peer {}", ip)));
            }
        }
        Ok(())
    }

    pub fn listen_sockaddr(&self) -> Result<SocketAddr, ConfigError> {
        parse_sockaddr(&self.listen_addr, BGP_PORT).map_err(ConfigError::Invalid)
    }

    pub fn min_keepalive(&self) -> Duration {
        Duration::from_secs(self.min_keepalive_secs)
    }

    /// IGP cost to reach `next_hop`.
    pub fn igp_cost(&self, next_hop: Ipv4Addr) -> u32 {
        self.igp_costs.get(&next_hop).copied().unwrap_or(0)
    }
}

/// RFC 4271: hold time is zero or at least three seconds.
fn check_hold_time(hold_time_secs: u64) -> Result<(), ConfigError> {
    if hold_time_secs == 1 || hold_time_secs == 2 || hold_time_secs > u16::MAX as u64 {
        return Err(ConfigError::Invalid(format!(
            "hold time {} must be 0 or between 3 and 65535",
            hold_time_secs
        )));
    }
    Ok(())
}

impl Default for Config {
    fn default() -> Self {
        Config {
            asn: 65000,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            listen_addr: default_listen_addr(),
            listen: default_listen(),
            hold_time_secs: default_hold_time(),
            connect_retry_secs: default_connect_retry_time(),
            min_keepalive_secs: default_min_keepalive(),
            always_compare_med: false,
            route_reflector: false,
            igp_costs: HashMap::new(),
            networks: Vec::new(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            peers: Vec::new(),
        }
    }
}
