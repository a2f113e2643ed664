use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peers::BackoffPolicy;
use crate::store::is_valid_label;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Top level domain every hostname of this mesh lives under.
    pub namespace: String,
    /// Address this node's hostnames resolve to.
    pub ip: IpAddr,
    pub port: u16,
    /// Socket the sync endpoint binds; defaults to `[::]:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    /// URL peers reach this node under; defaults to `http://ip:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_url: Option<String>,
    pub key_file: PathBuf,
    pub state_file: PathBuf,
    pub dns_file: PathBuf,
    pub hostnames: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub max_peers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_bind: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "mesh".into(),
            ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 7331,
            listen: None,
            advertise_url: None,
            key_file: default_key_file(),
            state_file: "./data_mesher.json".into(),
            dns_file: "./data_mesher_dns.json".into(),
            hostnames: Vec::new(),
            bootstrap_peers: Vec::new(),
            sync_interval_secs: 5,
            request_timeout_secs: 10,
            backoff_min_secs: 5,
            backoff_max_secs: 300,
            max_peers: 64,
            dns_bind: None,
        }
    }
}

fn default_key_file() -> PathBuf {
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    config_home.join("data_mesher").join("key")
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("data_mesher.toml"));
        if let Some(path) = path {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        let config: Config = figment
            .merge(Env::prefixed("DATA_MESHER_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_label(&self.namespace) {
            anyhow::bail!("Invalid namespace {:?}: must be a single DNS label", self.namespace);
        }
        if let Some(bad) = self.hostnames.iter().find(|h| !is_valid_label(h)) {
            anyhow::bail!("Invalid hostname {:?}: must be a single DNS label", bad);
        }
        if self.sync_interval_secs == 0 || self.request_timeout_secs == 0 {
            anyhow::bail!("sync_interval_secs and request_timeout_secs must be positive");
        }
        if self.backoff_min_secs == 0 || self.backoff_min_secs > self.backoff_max_secs {
            anyhow::bail!(
                "Invalid backoff range {}..{}",
                self.backoff_min_secs,
                self.backoff_max_secs
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port))
    }

    pub fn advertise_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", SocketAddr::new(self.ip, self.port)))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            min: Duration::from_secs(self.backoff_min_secs),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}
