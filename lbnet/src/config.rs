//! Daemon configuration.
//!
//! Settings come from an optional JSON file; command-line flags override
//! individual fields.

use crate::rules::{DFL_INACT_TRIES, MAX_EP_CHECKERS, MAX_INACT_TRIES, RuleConfig};
use crate::xsync::XSYNC_PORT;
use anyhow::{Context, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport used to replicate connection tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XsyncTransport {
    #[default]
    Http,
    /// Replication disabled.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Announced to peers as the sender of replicated entries.
    pub node_id: u16,
    pub xsync_listen: IpAddr,
    pub xsync_port: u16,
    /// Other cluster members; they listen on `xsync_port` too.
    pub cluster_nodes: Vec<IpAddr>,
    pub xsync_transport: XsyncTransport,
    pub tick_secs: u64,
    pub dp_queue_len: usize,
    pub dp_batch: usize,
    pub rule_inact_tries: u32,
    pub rule_check_secs: u64,
    pub ep_checkers: usize,
    pub ep_check_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            xsync_listen: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            xsync_port: XSYNC_PORT,
            cluster_nodes: Vec::new(),
            xsync_transport: XsyncTransport::Http,
            tick_secs: 10,
            dp_queue_len: 1024,
            dp_batch: 32,
            rule_inact_tries: DFL_INACT_TRIES,
            rule_check_secs: 15,
            ep_checkers: MAX_EP_CHECKERS,
            ep_check_secs: 2,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Read a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// Defaults or the `--config` file, with flags applied and validated.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let mut cfg = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        args.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dp_queue_len == 0 {
            bail!("dp_queue_len must be positive");
        }
        if self.dp_batch == 0 {
            bail!("dp_batch must be positive");
        }
        if self.tick_secs == 0 || self.rule_check_secs == 0 || self.ep_check_secs == 0 {
            bail!("intervals must be positive");
        }
        if self.rule_inact_tries == 0 || self.rule_inact_tries > MAX_INACT_TRIES {
            bail!(
                "rule_inact_tries {} out of range 1..={MAX_INACT_TRIES}",
                self.rule_inact_tries
            );
        }
        if self.ep_checkers == 0 || self.ep_checkers > MAX_EP_CHECKERS {
            bail!(
                "ep_checkers {} out of range 1..={MAX_EP_CHECKERS}",
                self.ep_checkers
            );
        }
        if self.xsync_transport == XsyncTransport::Http && self.xsync_port == 0 {
            bail!("xsync_port must be set");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn ep_check_period(&self) -> Duration {
        Duration::from_secs(self.ep_check_secs)
    }

    pub fn rule_config(&self) -> RuleConfig {
        RuleConfig {
            inact_tries: self.rule_inact_tries,
            check_interval: Duration::from_secs(self.rule_check_secs),
            checkers: self.ep_checkers,
        }
    }

    pub fn xsync_addr(&self) -> SocketAddr {
        SocketAddr::new(self.xsync_listen, self.xsync_port)
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.cluster_nodes
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.xsync_port))
            .collect()
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "lbnet")]
#[command(about = "Load-balancer and router control plane")]
pub struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Cluster peers (comma separated IP addresses)
    #[arg(long, value_delimiter = ',')]
    pub cluster_nodes: Vec<IpAddr>,

    /// Listen address for connection-tracking replication
    #[arg(long)]
    pub xsync_listen: Option<SocketAddr>,

    /// This node's id within the cluster
    #[arg(long)]
    pub node_id: Option<u16>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Reconciliation period in seconds
    #[arg(long)]
    pub tick_secs: Option<u64>,
}

impl Args {
    pub fn apply(&self, cfg: &mut Config) {
        if !self.cluster_nodes.is_empty() {
            cfg.cluster_nodes = self.cluster_nodes.clone();
        }
        if let Some(addr) = self.xsync_listen {
            cfg.xsync_listen = addr.ip();
            cfg.xsync_port = addr.port();
        }
        if let Some(id) = self.node_id {
            cfg.node_id = id;
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(secs) = self.tick_secs {
            cfg.tick_secs = secs;
        }
    }
}
