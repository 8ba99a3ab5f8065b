use crate::platform::PlatformFamily;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

pub type RecordId = u64;

/// Coarse process category. Each family shares a node-id range and a
/// default-port convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Management,
    Data,
    Sql,
    Api,
}

impl Family {
    /// Valid node-id range for members of this family.
    pub fn node_id_range(self) -> RangeInclusive<u64> {
        match self {
            Family::Management => 49..=52,
            Family::Data => 1..=48,
            Family::Sql => 53..=230,
            Family::Api => 231..=255,
        }
    }

    /// Default starting port before per-instance offsets. Api slots have no
    /// listening port of their own.
    pub fn portbase(self) -> Option<u16> {
        match self {
            Family::Management => Some(1186),
            Family::Data => Some(11860),
            Family::Sql => Some(3306),
            Family::Api => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Management => "management",
            Family::Data => "data",
            Family::Sql => "sql",
            Family::Api => "api",
        };
        f.write_str(s)
    }
}

/// Cluster-wide policy knob influencing several derived defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppArea {
    #[default]
    #[serde(rename = "simple testing")]
    SimpleTesting,
    Production,
    Realtime,
}

/// Cluster-wide write-load classification selecting buffer-size defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteLoad {
    Low,
    #[default]
    Medium,
    High,
}

/// Two-slot value: a derived/allocated default and an explicit user override.
/// The user slot always wins; derivation passes only ever touch the default
/// slot, so recomputation never clobbers an override, and an already-cached
/// default is not re-derived into a different value by the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting<T> {
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub default: Option<T>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub user: Option<T>,
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Self { default: None, user: None }
    }
}

impl<T> Setting<T> {
    pub fn effective(&self) -> Option<&T> {
        self.user.as_ref().or(self.default.as_ref())
    }

    pub fn is_user_set(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_unset(&self) -> bool {
        self.user.is_none() && self.default.is_none()
    }

    pub fn set_default(&mut self, value: T) {
        self.default = Some(value);
    }

    pub fn set_user(&mut self, value: T) {
        self.user = Some(value);
    }
}

impl<T: Copy> Setting<T> {
    pub fn value(&self) -> Option<T> {
        self.effective().copied()
    }
}

/// Outcome of the last hardware probe issued for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Never probed, or a probe is currently in flight.
    #[default]
    Pending,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: RecordId,
    pub name: String,
    /// Wildcard placeholder rows are ignored by auto-configuration and never
    /// probed.
    #[serde(default)]
    pub wildcard: bool,
    pub ram_mb: Option<u64>,
    pub cores: Option<u32>,
    #[serde(default)]
    pub platform: PlatformFamily,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
    #[serde(default)]
    pub install_dir: Setting<String>,
    #[serde(default)]
    pub data_dir: Setting<String>,
    pub internal_ip: Option<String>,
    pub fqdn: Option<String>,
    pub diskfree: Option<String>,
    pub docker_info: Option<String>,
    #[serde(default)]
    pub probe_status: ProbeStatus,
    pub err_msg: Option<String>,
    /// Generation token of the newest probe request issued for this host.
    /// Replies carrying an older token are discarded as stale.
    #[serde(default)]
    pub probe_seq_issued: u64,
    /// Token of the newest reply actually applied.
    #[serde(default)]
    pub probe_seq_applied: u64,
    /// RFC3339 timestamp of the last applied probe reply.
    pub last_probed: Option<String>,
}

impl Host {
    pub fn new(name: &str, wildcard: bool) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            wildcard,
            ram_mb: None,
            cores: None,
            platform: PlatformFamily::Unknown,
            os_flavor: None,
            os_version: None,
            install_dir: Setting::default(),
            data_dir: Setting::default(),
            internal_ip: None,
            fqdn: None,
            diskfree: None,
            docker_info: None,
            probe_status: ProbeStatus::Pending,
            err_msg: None,
            probe_seq_issued: 0,
            probe_seq_applied: 0,
            last_probed: None,
        }
    }
}

/// One of the five fixed process type rows seeded at first startup.
/// Immutable afterward except for the naming sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessType {
    pub id: RecordId,
    pub name: String,
    pub family: Family,
    /// Monotonic counter used to build default instance names.
    pub name_seq: u64,
}

impl ProcessType {
    pub fn new(name: &str, family: Family) -> Self {
        Self { id: 0, name: name.to_string(), family, name_seq: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Defined,
    Configured,
}

/// Per-process tuning parameters. All values are `Setting`s: the deriver
/// fills default slots from hardware facts and cluster policy, explicit
/// overrides live in the user slot. Only data-family processes use most of
/// these; management and sql instances carry them unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessParams {
    #[serde(default)]
    pub data_memory: Setting<u64>,
    #[serde(default)]
    pub disk_page_buffer_memory: Setting<u64>,
    #[serde(default)]
    pub shared_global_memory: Setting<u64>,
    #[serde(default)]
    pub redo_buffer: Setting<u64>,
    #[serde(default)]
    pub send_buffer_memory: Setting<u64>,
    #[serde(default)]
    pub receive_buffer_memory: Setting<u64>,
    #[serde(default)]
    pub heartbeat_interval_db_db: Setting<u64>,
    #[serde(default)]
    pub heartbeat_interval_db_api: Setting<u64>,
    #[serde(default)]
    pub max_no_of_execution_threads: Setting<u64>,
    #[serde(default)]
    pub no_of_fragment_log_parts: Setting<u64>,
    #[serde(default)]
    pub no_of_fragment_log_files: Setting<u64>,
    #[serde(default)]
    pub fragment_log_file_size: Setting<u64>,
    #[serde(default)]
    pub no_of_replicas: Setting<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: RecordId,
    pub name: String,
    pub host_id: RecordId,
    pub ptype_id: RecordId,
    /// Cluster-member id, allocated from the family range. Never reused.
    pub node_id: Option<u64>,
    #[serde(default)]
    pub port: Setting<u16>,
    #[serde(default)]
    pub data_dir: Setting<String>,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub params: ProcessParams,
}

impl Process {
    pub fn new(name: &str, host_id: RecordId, ptype_id: RecordId) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            host_id,
            ptype_id,
            node_id: None,
            port: Setting::default(),
            data_dir: Setting::default(),
            status: ProcessStatus::Defined,
            params: ProcessParams::default(),
        }
    }
}

/// Singleton policy record, always id 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub app_area: AppArea,
    #[serde(default)]
    pub write_load: WriteLoad,
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_key_based: bool,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            id: 0,
            name: "Cluster".to_string(),
            app_area: AppArea::default(),
            write_load: WriteLoad::default(),
            ssh_user: None,
            ssh_key_based: false,
        }
    }
}
