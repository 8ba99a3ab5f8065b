//! Parameter derivation.
//!
//! Computes default values for the performance-relevant parameters of data
//! nodes from (a) hardware facts of the hosting machine, (b) how many
//! colleague processes share that machine, and (c) the cluster policy knobs.
//! This is a stateless full recomputation pass: every invocation reruns the
//! whole formula set over current store contents and writes results into the
//! default slots only, so user overrides survive and back-to-back runs are
//! idempotent.

use crate::models::{AppArea, Family, RecordId, WriteLoad};
use crate::store::Deployment;
use tracing::debug;

// Fixed budget heads subtracted from host RAM before the DataMemory share.
const RESERVED_OS_MB: u64 = 1024;
const OS_BUFFERS_MB: u64 = 300;
const CATALOG_ESTIMATE_MB: u64 = 150;
const OPS_OVERHEAD_MB: u64 = 100;
const BACKUP_OVERHEAD_MB: u64 = 52;
// Interconnect buffer estimate: per-mysqld pool factor and fixed base.
const INTERCONNECT_POOL_FACTOR: u64 = 4;
const INTERCONNECT_FIXED_MB: u64 = 100;

const DEFAULT_EXECUTION_THREADS: u64 = 8;
const SHARED_GLOBAL_MEMORY_DEFAULT_MB: u64 = 400;
const MIN_FRAGMENT_LOG_FILES: u64 = 3;

/// Clamp bounds for derived DataMemory, from the kernel configuration.
#[derive(Debug, Clone, Copy)]
pub struct DataMemoryLimits {
    pub min_mb: u64,
    pub max_mb: u64,
}

impl Default for DataMemoryLimits {
    fn default() -> Self {
        Self { min_mb: 64, max_mb: 1_048_576 }
    }
}

/// Buffer sizes (MB) selected by the cluster write-load classification:
/// (SendBufferMemory, ReceiveBufferMemory, RedoBuffer).
fn buffers_for_load(load: WriteLoad) -> (u64, u64, u64) {
    match load {
        WriteLoad::High => (8, 8, 64),
        WriteLoad::Medium => (4, 4, 48),
        WriteLoad::Low => (2, 2, 32),
    }
}

/// Heartbeat intervals (ms) for (DbDb, DbApi).
fn heartbeats_for_area(area: AppArea) -> (u64, u64) {
    if area == AppArea::Realtime {
        (1500, 1500)
    } else {
        (15000, 15000)
    }
}

/// NoOfFragmentLogParts as a step function of MaxNoOfExecutionThreads.
fn fragment_log_parts(threads: u64) -> u64 {
    match threads {
        0..=3 => 4,
        4..=7 => 8,
        8..=11 => 12,
        12..=15 => 16,
        16..=19 => 20,
        20..=23 => 24,
        24..=27 => 28,
        28..=31 => 32,
        32..=39 => 32,
        40..=55 => 32,
        _ => 32,
    }
}

/// SharedGlobalMemory tier, driven by the disk page buffer size.
fn shared_global_memory(disk_page_buffer_mb: u64) -> u64 {
    if disk_page_buffer_mb > 8192 {
        1024
    } else if disk_page_buffer_mb > 64 {
        400
    } else {
        SHARED_GLOBAL_MEMORY_DEFAULT_MB
    }
}

/// All-pairs estimate of memory eaten by inter-node send/receive buffers.
fn interconnect_mb(mysqld_count: u64, data_node_count: u64, send_buffer_mb: u64) -> u64 {
    mysqld_count * send_buffer_mb * 2 * INTERCONNECT_POOL_FACTOR
        + INTERCONNECT_FIXED_MB
        + data_node_count * data_node_count.saturating_sub(1) * 2 * send_buffer_mb
}

/// Everything DataMemory depends on, gathered before mutation.
struct DataNodeFacts {
    process_id: RecordId,
    ram_mb: Option<u64>,
    data_nodes_on_host: u64,
}

/// Rerun the whole derivation over the deployment. Invoked eagerly after
/// auto-configuration, after a probe reply lands, and after cluster policy
/// edits.
pub fn derive_defaults(dep: &mut Deployment, limits: &DataMemoryLimits) {
    let area = dep.cluster.app_area;
    let (send_mb, recv_mb, redo_mb) = buffers_for_load(dep.cluster.write_load);
    let (hb_db, hb_api) = heartbeats_for_area(area);
    let dpbm_default: u64 = if area == AppArea::SimpleTesting { 64 } else { 512 };
    let flfs_default: u64 = if area == AppArea::SimpleTesting { 64 } else { 256 };

    let data_node_count = dep.family_count(Family::Data) as u64;
    let mysqld_count = dep.family_count(Family::Sql) as u64;
    let replicas = 2 - (data_node_count % 2);

    let facts: Vec<DataNodeFacts> = dep
        .processes
        .iter()
        .filter(|p| dep.family_of(p) == Some(Family::Data))
        .map(|p| DataNodeFacts {
            process_id: p.id,
            ram_mb: dep.hosts.get(p.host_id).and_then(|h| h.ram_mb),
            data_nodes_on_host: dep.data_nodes_on_host(p.host_id).max(1) as u64,
        })
        .collect();

    for fact in facts {
        let Some(proc) = dep.processes.get_mut(fact.process_id) else { continue };
        let p = &mut proc.params;

        p.send_buffer_memory.set_default(send_mb);
        p.receive_buffer_memory.set_default(recv_mb);
        p.redo_buffer.set_default(redo_mb);
        p.heartbeat_interval_db_db.set_default(hb_db);
        p.heartbeat_interval_db_api.set_default(hb_api);
        p.disk_page_buffer_memory.set_default(dpbm_default);
        p.fragment_log_file_size.set_default(flfs_default);
        p.max_no_of_execution_threads.set_default(DEFAULT_EXECUTION_THREADS);
        p.no_of_replicas.set_default(replicas);

        let threads = p.max_no_of_execution_threads.value().unwrap_or(DEFAULT_EXECUTION_THREADS);
        p.no_of_fragment_log_parts.set_default(fragment_log_parts(threads));

        let dpbm = p.disk_page_buffer_memory.value().unwrap_or(dpbm_default);
        p.shared_global_memory.set_default(shared_global_memory(dpbm));
        let sgm = p.shared_global_memory.value().unwrap_or(SHARED_GLOBAL_MEMORY_DEFAULT_MB);
        let redo = p.redo_buffer.value().unwrap_or(redo_mb);
        let send = p.send_buffer_memory.value().unwrap_or(send_mb);

        if let Some(ram_mb) = fact.ram_mb {
            let overhead = RESERVED_OS_MB
                + OS_BUFFERS_MB
                + dpbm
                + interconnect_mb(mysqld_count, data_node_count, send)
                + CATALOG_ESTIMATE_MB
                + redo
                + OPS_OVERHEAD_MB
                + BACKUP_OVERHEAD_MB
                + sgm;
            let usable = ram_mb.saturating_sub(overhead);
            let mut data_memory = 800 * usable / (1000 * fact.data_nodes_on_host);
            if area == AppArea::SimpleTesting {
                data_memory /= 2;
            }
            let data_memory = data_memory.clamp(limits.min_mb, limits.max_mb);
            p.data_memory.set_default(data_memory);
        }

        if let Some(data_memory) = p.data_memory.value() {
            let flfs = p.fragment_log_file_size.value().unwrap_or(flfs_default);
            let files = (6 * data_memory / flfs / 4).max(MIN_FRAGMENT_LOG_FILES);
            p.no_of_fragment_log_files.set_default(files);
        }
    }

    debug!(
        data_nodes = data_node_count,
        mysqlds = mysqld_count,
        replicas,
        "derived parameter defaults"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordId;

    fn fixture(app_area: AppArea, write_load: WriteLoad) -> (Deployment, RecordId) {
        let mut dep = Deployment::new();
        dep.cluster.app_area = app_area;
        dep.cluster.write_load = write_load;
        let h = dep.add_host("alpha", false);
        dep.hosts.get_mut(h).unwrap().ram_mb = Some(16384);
        let t = dep.ptype_by_name("ndbmtd").unwrap().id;
        let p = dep.add_process(None, h, t).unwrap();
        (dep, p)
    }

    #[test]
    fn test_data_memory_worked_example() {
        // RAM=16384, one data node on the host, DPBM=64 (explicit), SGM tier
        // falls back to the 400 default, RedoBuffer=32 and SendBuffer=2 from
        // low write load, no mysqld peers, non-testing app area:
        // 800*(16384-1024-300-64-100-150-32-100-52-400)/1000 = 11329
        let (mut dep, p) = fixture(AppArea::Production, WriteLoad::Low);
        dep.processes.get_mut(p).unwrap().params.disk_page_buffer_memory.set_user(64);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        let params = &dep.processes.get(p).unwrap().params;
        assert_eq!(params.data_memory.value(), Some(11329));
        assert_eq!(params.shared_global_memory.value(), Some(400));
        assert_eq!(params.redo_buffer.value(), Some(32));
        assert_eq!(params.send_buffer_memory.value(), Some(2));
    }

    #[test]
    fn test_simple_testing_halves_data_memory() {
        let (mut dep, p) = fixture(AppArea::SimpleTesting, WriteLoad::Low);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        let full = {
            let (mut dep2, p2) = fixture(AppArea::Production, WriteLoad::Low);
            // align the page buffer so only the halving differs
            dep2.processes.get_mut(p2).unwrap().params.disk_page_buffer_memory.set_user(64);
            derive_defaults(&mut dep2, &DataMemoryLimits::default());
            dep2.processes.get(p2).unwrap().params.data_memory.value().unwrap()
        };
        let halved = dep.processes.get(p).unwrap().params.data_memory.value().unwrap();
        assert_eq!(halved, full / 2);
    }

    #[test]
    fn test_recomputation_is_idempotent() {
        let (mut dep, p) = fixture(AppArea::Production, WriteLoad::High);
        let limits = DataMemoryLimits::default();
        derive_defaults(&mut dep, &limits);
        let first = dep.processes.get(p).unwrap().params.clone();
        derive_defaults(&mut dep, &limits);
        let second = dep.processes.get(p).unwrap().params.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_user_override_survives_recomputation() {
        let (mut dep, p) = fixture(AppArea::Production, WriteLoad::Medium);
        dep.processes.get_mut(p).unwrap().params.data_memory.set_user(2048);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        let params = &dep.processes.get(p).unwrap().params;
        assert_eq!(params.data_memory.value(), Some(2048));
        assert!(params.data_memory.default.is_some());
    }

    #[test]
    fn test_write_load_buffer_table() {
        for (load, send, recv, redo) in [
            (WriteLoad::High, 8, 8, 64),
            (WriteLoad::Medium, 4, 4, 48),
            (WriteLoad::Low, 2, 2, 32),
        ] {
            let (mut dep, p) = fixture(AppArea::Production, load);
            derive_defaults(&mut dep, &DataMemoryLimits::default());
            let params = &dep.processes.get(p).unwrap().params;
            assert_eq!(params.send_buffer_memory.value(), Some(send));
            assert_eq!(params.receive_buffer_memory.value(), Some(recv));
            assert_eq!(params.redo_buffer.value(), Some(redo));
        }
    }

    #[test]
    fn test_heartbeats_follow_app_area() {
        let (mut dep, p) = fixture(AppArea::Realtime, WriteLoad::Low);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        assert_eq!(
            dep.processes.get(p).unwrap().params.heartbeat_interval_db_db.value(),
            Some(1500)
        );

        let (mut dep, p) = fixture(AppArea::SimpleTesting, WriteLoad::Low);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        assert_eq!(
            dep.processes.get(p).unwrap().params.heartbeat_interval_db_db.value(),
            Some(15000)
        );
    }

    #[test]
    fn test_fragment_log_part_steps() {
        assert_eq!(fragment_log_parts(2), 4);
        assert_eq!(fragment_log_parts(8), 12);
        assert_eq!(fragment_log_parts(15), 16);
        assert_eq!(fragment_log_parts(31), 32);
        assert_eq!(fragment_log_parts(72), 32);
    }

    #[test]
    fn test_shared_global_memory_tiers() {
        assert_eq!(shared_global_memory(64), 400);
        assert_eq!(shared_global_memory(512), 400);
        assert_eq!(shared_global_memory(9000), 1024);
    }

    #[test]
    fn test_replicas_parity() {
        let (mut dep, _p) = fixture(AppArea::Production, WriteLoad::Low);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        let one = dep
            .processes
            .iter()
            .find(|p| dep.family_of(p) == Some(Family::Data))
            .unwrap();
        // odd data node count: a single unpaired node, so one replica
        assert_eq!(one.params.no_of_replicas.value(), Some(1));

        let h = dep.add_host("beta", false);
        let t = dep.ptype_by_name("ndbmtd").unwrap().id;
        dep.add_process(None, h, t).unwrap();
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        for proc in dep.processes.iter().filter(|p| dep.family_of(p) == Some(Family::Data)) {
            assert_eq!(proc.params.no_of_replicas.value(), Some(2));
        }
    }

    #[test]
    fn test_clamping_applies() {
        let (mut dep, p) = fixture(AppArea::Production, WriteLoad::Low);
        dep.processes.get_mut(p).unwrap().params.disk_page_buffer_memory.set_user(64);
        let limits = DataMemoryLimits { min_mb: 64, max_mb: 4096 };
        derive_defaults(&mut dep, &limits);
        assert_eq!(dep.processes.get(p).unwrap().params.data_memory.value(), Some(4096));

        // tiny host clamps up to the floor
        dep.hosts.iter_mut().next().unwrap().ram_mb = Some(1500);
        derive_defaults(&mut dep, &limits);
        assert_eq!(dep.processes.get(p).unwrap().params.data_memory.value(), Some(64));
    }

    #[test]
    fn test_fragment_log_files_formula() {
        let (mut dep, p) = fixture(AppArea::Production, WriteLoad::Low);
        dep.processes.get_mut(p).unwrap().params.disk_page_buffer_memory.set_user(64);
        derive_defaults(&mut dep, &DataMemoryLimits::default());
        let params = &dep.processes.get(p).unwrap().params;
        // 6 * 11329 / 256 / 4 = 66
        assert_eq!(params.no_of_fragment_log_files.value(), Some(66));
        assert_eq!(params.fragment_log_file_size.value(), Some(256));
    }
}
