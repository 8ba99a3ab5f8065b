use crate::params::DataMemoryLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default)]
    pub probe: ProbeConf,
    #[serde(default)]
    pub limits: LimitsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeConf {
    /// Command template for the hardware probe, with a `{host}` placeholder.
    /// Ex: "ssh {host} clusterconf-hwinfo". Unset disables probing.
    pub command: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LimitsConf {
    #[serde(default = "default_data_memory_min")]
    pub data_memory_min_mb: u64,
    #[serde(default = "default_data_memory_max")]
    pub data_memory_max_mb: u64,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_data_file() -> String {
    "./data/deployment.json".into()
}
fn default_probe_timeout() -> u64 {
    20
}
fn default_data_memory_min() -> u64 {
    DataMemoryLimits::default().min_mb
}
fn default_data_memory_max() -> u64 {
    DataMemoryLimits::default().max_mb
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_file: default_data_file(),
            probe: ProbeConf::default(),
            limits: LimitsConf::default(),
        }
    }
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { command: None, timeout_secs: default_probe_timeout() }
    }
}

impl Default for LimitsConf {
    fn default() -> Self {
        Self {
            data_memory_min_mb: default_data_memory_min(),
            data_memory_max_mb: default_data_memory_max(),
        }
    }
}

impl LimitsConf {
    /// Inverted bounds are swapped rather than handed to `clamp`, which
    /// panics on `min > max`.
    pub fn data_memory(&self) -> DataMemoryLimits {
        let (mut min_mb, mut max_mb) = (self.data_memory_min_mb, self.data_memory_max_mb);
        if min_mb > max_mb {
            warn!(min_mb, max_mb, "data memory limits are inverted, swapping");
            std::mem::swap(&mut min_mb, &mut max_mb);
        }
        DataMemoryLimits { min_mb, max_mb }
    }
}

/// Load kernel.yaml (path overridable via CLUSTERCONF_CONFIG); any problem
/// falls back to defaults with a logged warning.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("CLUSTERCONF_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!("no {path}, using default configuration");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg: KernelConfig = serde_yaml::from_str("listen_port: 9090").unwrap();
        assert_eq!(cfg.listen_port, 9090);
        assert_eq!(cfg.data_file, "./data/deployment.json");
        assert_eq!(cfg.probe.timeout_secs, 20);
        assert!(cfg.probe.command.is_none());
        let limits = cfg.limits.data_memory();
        assert_eq!(limits.min_mb, DataMemoryLimits::default().min_mb);
        assert_eq!(limits.max_mb, DataMemoryLimits::default().max_mb);
    }

    #[test]
    fn test_inverted_limits_swapped() {
        let cfg: KernelConfig = serde_yaml::from_str(
            "limits:\n  data_memory_min_mb: 4096\n  data_memory_max_mb: 64\n",
        )
        .unwrap();
        let limits = cfg.limits.data_memory();
        assert_eq!(limits.min_mb, 64);
        assert_eq!(limits.max_mb, 4096);
    }

    #[test]
    fn test_probe_command_parsed() {
        let cfg: KernelConfig = serde_yaml::from_str(
            "probe:\n  command: \"ssh {host} clusterconf-hwinfo\"\n  timeout_secs: 5\n",
        )
        .unwrap();
        assert_eq!(cfg.probe.command.as_deref(), Some("ssh {host} clusterconf-hwinfo"));
        assert_eq!(cfg.probe.timeout_secs, 5);
    }
}
