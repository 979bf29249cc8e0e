//! Configuration: a TOML file plus a small CLI overlay, the
//! way `hyper`'s own example servers take a handful of `clap` flags but
//! defer everything else to a typed config struct.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

fn default_worker_count() -> usize {
    0
}

fn default_main_scale_factor() -> usize {
    1
}

fn default_stall_sweep_secs() -> u64 {
    60
}

fn default_fd_limit() -> u64 {
    65536
}

fn default_compare_threshold() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_main_scale_factor")]
    pub main_scale_factor: usize,

    #[serde(default = "default_stall_sweep_secs")]
    pub stall_sweep_secs: u64,

    #[serde(default = "default_fd_limit")]
    pub fd_limit: u64,

    #[serde(default = "default_compare_threshold")]
    pub compare_threshold: usize,

    pub backpressure_control_addr: Option<SocketAddr>,
    pub management_listen_addr: Option<SocketAddr>,

    pub cache_socket_path: Option<PathBuf>,
    pub cache_work_dir: PathBuf,

    /// TOS/DSCP marks for cache-hit and cache-miss origin bytes
    /// respectively; each is a 6-bit value (0-63).
    #[serde(default)]
    pub tos_mark_hit: u8,
    #[serde(default)]
    pub tos_mark_miss: u8,
}

impl Config {
    pub fn worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get() * self.main_scale_factor.max(1)
        } else {
            self.worker_count
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Config> {
        toml::from_str(s).map_err(Error::new_config)
    }
}

/// Config path plus a work directory; `--reset-cache` erases volume
/// state and exits without starting the proxy.
#[derive(Debug, Parser)]
#[command(name = "cacherelayd", about = "Transparent checksum-verified-cache HTTP/1.x forward proxy")]
pub struct Cli {
    #[arg(long)]
    pub config: PathBuf,

    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    #[arg(long)]
    pub reset_cache: bool,
}

impl Cli {
    pub async fn load_config(&self) -> Result<Config> {
        let text = tokio::fs::read_to_string(&self.config).await?;
        let mut config = Config::from_toml_str(&text)?;
        if let Some(dir) = &self.work_dir {
            config.cache_work_dir = dir.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_falls_back_to_num_cpus_times_scale() {
        let cfg = Config {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            worker_count: 0,
            main_scale_factor: 2,
            stall_sweep_secs: 60,
            fd_limit: 65536,
            compare_threshold: 4096,
            backpressure_control_addr: None,
            management_listen_addr: None,
            cache_socket_path: None,
            cache_work_dir: PathBuf::from("/tmp"),
            tos_mark_hit: 0,
            tos_mark_miss: 0,
        };
        assert_eq!(cfg.worker_count(), num_cpus::get() * 2);
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            listen_addr = "0.0.0.0:3128"
            cache_work_dir = "/var/lib/cacherelay"
        "#;
        let cfg = Config::from_toml_str(text).unwrap();
        assert_eq!(cfg.worker_count, 0);
        assert_eq!(cfg.stall_sweep_secs, 60);
    }
}
