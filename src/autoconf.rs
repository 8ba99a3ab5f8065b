//! Auto-configuration: populate a default topology over the registered
//! hosts when no processes exist yet.
//!
//! This is a fixed decision table keyed on host count, not a placement
//! algorithm. Management hosts are capped at two because the node-id budget
//! for non-data roles tops out at 255.

use crate::alloc::{self, AllocError};
use crate::params::{self, DataMemoryLimits};
use crate::store::Deployment;
use crate::trees::Trees;
use tracing::{info, warn};

/// One planned process: which type goes on which host.
struct Slot {
    ptype: &'static str,
    host_index: usize,
}

/// The decision table. Host indexes refer to the non-wildcard hosts in
/// creation order. Data nodes use the multithreaded daemon. Every row plans
/// exactly three api slots; with fewer than three hosts to go around the
/// spares double up on host 0.
fn plan(host_count: usize) -> Vec<Slot> {
    let slot = |ptype: &'static str, host_index: usize| Slot { ptype, host_index };
    match host_count {
        0 => Vec::new(),
        1 => vec![
            slot("ndb_mgmd", 0),
            slot("ndbmtd", 0),
            slot("ndbmtd", 0),
            slot("mysqld", 0),
            slot("api", 0),
            slot("api", 0),
            slot("api", 0),
        ],
        2 => vec![
            slot("ndb_mgmd", 0),
            slot("ndb_mgmd", 1),
            slot("ndbmtd", 0),
            slot("ndbmtd", 1),
            slot("mysqld", 0),
            slot("mysqld", 1),
            slot("api", 0),
            slot("api", 1),
            slot("api", 0),
        ],
        3 => vec![
            // one pure management host, one mgmt+sql+data, one sql+data
            slot("ndb_mgmd", 0),
            slot("ndb_mgmd", 1),
            slot("ndbmtd", 1),
            slot("ndbmtd", 2),
            slot("mysqld", 1),
            slot("mysqld", 2),
            slot("api", 0),
            slot("api", 0),
            slot("api", 0),
        ],
        4 => vec![
            slot("ndb_mgmd", 0),
            slot("ndb_mgmd", 1),
            slot("ndbmtd", 0),
            slot("ndbmtd", 1),
            slot("ndbmtd", 2),
            slot("ndbmtd", 3),
            slot("mysqld", 0),
            slot("mysqld", 1),
            slot("mysqld", 2),
            slot("mysqld", 3),
            slot("api", 0),
            slot("api", 1),
            slot("api", 0),
        ],
        n => {
            // two management hosts with api on each; sql+data spread over
            // the rest, keeping the data-node count even for replica pairs
            let mut slots = vec![slot("ndb_mgmd", 0), slot("ndb_mgmd", 1)];
            let mut data_hosts = n - 2;
            if data_hosts % 2 == 1 {
                data_hosts -= 1;
            }
            for i in 0..data_hosts {
                slots.push(slot("ndbmtd", 2 + i));
            }
            for i in 2..n {
                slots.push(slot("mysqld", i));
            }
            slots.push(slot("api", 0));
            slots.push(slot("api", 1));
            slots.push(slot("api", 0));
            slots
        }
    }
}

/// Populate the default topology. A no-op (returning 0) when processes
/// already exist or no usable host is registered. Runs allocation and the
/// parameter deriver on everything it creates.
pub fn auto_configure(
    dep: &mut Deployment,
    trees: &mut Trees,
    limits: &DataMemoryLimits,
) -> Result<usize, AllocError> {
    if !dep.processes.is_empty() {
        info!("processes already defined, skipping auto-configuration");
        return Ok(0);
    }
    let hosts: Vec<u64> = dep.hosts.iter().filter(|h| !h.wildcard).map(|h| h.id).collect();
    if hosts.is_empty() {
        warn!("no usable hosts registered, nothing to auto-configure");
        return Ok(0);
    }

    let mut created = 0usize;
    for slot in plan(hosts.len()) {
        let host_id = hosts[slot.host_index];
        let ptype_id = match dep.ptype_by_name(slot.ptype) {
            Some(t) => t.id,
            None => continue,
        };
        // a slot that cannot be created or allocated is rolled back and
        // skipped; the rest of the plan still goes through
        let process_id = match alloc::create_process(dep, None, host_id, ptype_id) {
            Ok(id) => id,
            Err(e) => {
                warn!("auto-configuration skipping a {} slot: {e}", slot.ptype);
                continue;
            }
        };
        if let Some(proc) = dep.processes.get(process_id).cloned() {
            if let Some(family) = dep.family_of(&proc) {
                trees.add_process(process_id, &proc.name, proc.status, host_id, family);
            }
        }
        created += 1;
    }

    params::derive_defaults(dep, limits);
    info!(created, hosts = hosts.len(), "auto-configured default topology");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Family, RecordId};

    fn hosts(dep: &mut Deployment, n: usize) -> Vec<RecordId> {
        (0..n)
            .map(|i| {
                let id = dep.add_host(&format!("host{i}"), false);
                dep.hosts.get_mut(id).unwrap().ram_mb = Some(16384);
                id
            })
            .collect()
    }

    fn placements(dep: &Deployment, ptype: &str) -> Vec<RecordId> {
        let t = dep.ptype_by_name(ptype).unwrap().id;
        dep.processes.iter().filter(|p| p.ptype_id == t).map(|p| p.host_id).collect()
    }

    #[test]
    fn test_three_host_decision_table() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 3);
        for &h in &ids {
            trees.add_host(h, &dep.hosts.get(h).unwrap().name.clone());
        }
        let created = auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(created, 9);

        assert_eq!(placements(&dep, "ndb_mgmd"), vec![ids[0], ids[1]]);
        assert_eq!(placements(&dep, "api"), vec![ids[0], ids[0], ids[0]]);
        assert_eq!(placements(&dep, "mysqld"), vec![ids[1], ids[2]]);
        assert_eq!(placements(&dep, "ndbmtd"), vec![ids[1], ids[2]]);
        assert!(trees.verify(&dep));
    }

    #[test]
    fn test_single_host_colocates_everything() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 1);
        trees.add_host(ids[0], "host0");
        auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert!(dep.processes.iter().all(|p| p.host_id == ids[0]));
        assert_eq!(placements(&dep, "ndbmtd").len(), 2);
        assert_eq!(placements(&dep, "ndb_mgmd").len(), 1);
    }

    #[test]
    fn test_large_topology_caps_management_and_evens_data() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 7);
        for &h in &ids {
            trees.add_host(h, "h");
        }
        auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(placements(&dep, "ndb_mgmd"), vec![ids[0], ids[1]]);
        // 5 non-management hosts, parity-trimmed to 4 data nodes
        assert_eq!(placements(&dep, "ndbmtd").len(), 4);
        assert_eq!(placements(&dep, "mysqld").len(), 5);
        // derived replica count reflects the even data-node total
        let data = dep
            .processes
            .iter()
            .find(|p| dep.family_of(p) == Some(Family::Data))
            .unwrap();
        assert_eq!(data.params.no_of_replicas.value(), Some(2));
    }

    #[test]
    fn test_two_host_row_doubles_up_third_api() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 2);
        for &h in &ids {
            trees.add_host(h, "h");
        }
        auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(placements(&dep, "api"), vec![ids[0], ids[1], ids[0]]);
        assert!(trees.verify(&dep));
    }

    #[test]
    fn test_data_range_exhaustion_skips_excess_slots() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 52);
        for &h in &ids {
            trees.add_host(h, "h");
        }
        // 50 data slots planned, but the data node-id range only holds 48:
        // the surplus is skipped, nothing half-created stays behind
        auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(placements(&dep, "ndbmtd").len(), 48);
        assert!(dep.processes.iter().all(|p| p.node_id.is_some()));
        assert!(trees.verify(&dep));
    }

    #[test]
    fn test_noop_when_processes_exist() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        let ids = hosts(&mut dep, 2);
        let t = dep.ptype_by_name("mysqld").unwrap().id;
        dep.add_process(None, ids[0], t).unwrap();
        let created = auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(created, 0);
        assert_eq!(dep.processes.len(), 1);
    }

    #[test]
    fn test_wildcard_hosts_ignored() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        dep.add_host("*", true);
        let created = auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn test_node_ids_assigned_within_family_ranges() {
        let mut dep = Deployment::new();
        let mut trees = Trees::new();
        hosts(&mut dep, 3);
        auto_configure(&mut dep, &mut trees, &DataMemoryLimits::default()).unwrap();
        for proc in dep.processes.iter() {
            let family = dep.family_of(proc).unwrap();
            let node_id = proc.node_id.expect("every process gets a node id");
            assert!(family.node_id_range().contains(&node_id));
        }
        // first management and data allocations start at their range floors
        let mgmds = placements(&dep, "ndb_mgmd");
        assert_eq!(mgmds.len(), 2);
        let first_mgmd = dep
            .processes
            .iter()
            .find(|p| dep.family_of(p) == Some(Family::Management))
            .unwrap();
        assert_eq!(first_mgmd.node_id, Some(49));
    }
}
