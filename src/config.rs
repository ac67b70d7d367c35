use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub disk: Disk,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub cluster: Option<Cluster>,
    #[serde(default)]
    pub upstream: Upstream,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if !self.disk.dir.trim().is_empty() && self.disk.limit_bytes == 0 {
            return Err(anyhow!("disk.limit_bytes must be set when disk.dir is configured"));
        }
        if let Some(cluster) = &self.cluster {
            if cluster.secret.trim().is_empty() {
                return Err(anyhow!("cluster.secret is required in cluster mode"));
            }
            if cluster.nodes.is_empty() {
                return Err(anyhow!("cluster.nodes must not be empty"));
            }
        }
        if let Some(tls) = &self.tls {
            if tls.cert.trim().is_empty() || tls.key.trim().is_empty() {
                return Err(anyhow!("tls.cert and tls.key must both be set"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_read_header_timeout", with = "humantime_serde")]
    pub read_header_timeout: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: String::new(),
            read_header_timeout: default_read_header_timeout(),
        }
    }
}

fn default_read_header_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Deserialize, Default)]
pub struct Disk {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub limit_bytes: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct Tls {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct RuleConfig {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub ignore_authorization_header: bool,
    #[serde(default)]
    pub ignored_parameters: Vec<String>,
    #[serde(default)]
    pub direct_connect: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Cluster {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Node {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Upstream {
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
