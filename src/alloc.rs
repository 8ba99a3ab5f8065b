//! Node-id and port allocation.
//!
//! Node ids come from a per-family cursor over the family's fixed numeric
//! range. The cursor only moves forward: ids freed by deletion are never
//! reclaimed, and walking past the end of the range is an explicit error.
//!
//! Port assignment is one generic routine for every family that listens on a
//! port (the original carried three near-identical copies keyed on attribute
//! name). It is best effort: a collision it cannot sidestep is logged and the
//! port left unassigned for a later verification pass to surface.

use crate::models::{Family, RecordId};
use crate::store::{Deployment, StoreError};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("node id range exhausted for family {0}")]
    NodeIdExhausted(Family),
    #[error("process {0} not found")]
    UnknownProcess(RecordId),
    #[error("process {0} has no resolvable process type")]
    UnknownFamily(RecordId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hand out the next node id for a family. Strictly increasing, never
/// reused.
pub fn next_node_id(dep: &mut Deployment, family: Family) -> Result<u64, AllocError> {
    let range = family.node_id_range();
    let cursor = dep.node_id_cursors.entry(family).or_insert(*range.start());
    if *cursor > *range.end() {
        return Err(AllocError::NodeIdExhausted(family));
    }
    let id = *cursor;
    *cursor += 1;
    Ok(id)
}

/// Assign a node id to a process that does not have one yet.
pub fn assign_node_id(dep: &mut Deployment, process_id: RecordId) -> Result<u64, AllocError> {
    let proc = dep.processes.get(process_id).ok_or(AllocError::UnknownProcess(process_id))?;
    if let Some(existing) = proc.node_id {
        return Ok(existing);
    }
    let family = dep.family_of(proc).ok_or(AllocError::UnknownFamily(process_id))?;
    let node_id = next_node_id(dep, family)?;
    if let Some(proc) = dep.processes.get_mut(process_id) {
        proc.node_id = Some(node_id);
    }
    Ok(node_id)
}

/// Assign a default port to a process, avoiding collisions with colleague
/// processes (same family, same host). Returns the assigned port, or `None`
/// when the family has no port, the assignment was skipped on collision, or
/// a value was already cached for this instance.
pub fn assign_port(dep: &mut Deployment, process_id: RecordId) -> Result<Option<u16>, AllocError> {
    let proc = dep.processes.get(process_id).ok_or(AllocError::UnknownProcess(process_id))?;
    let family = dep.family_of(proc).ok_or(AllocError::UnknownFamily(process_id))?;
    let Some(portbase) = family.portbase() else {
        return Ok(None);
    };
    // A value already cached as this instance's default (or set by the user)
    // stays put: recomputation must not re-trigger assignment.
    if !proc.port.is_unset() {
        return Ok(proc.port.value());
    }
    let host_id = proc.host_id;

    let colleagues = dep.colleagues(host_id, family);
    if colleagues.len() == 1 {
        // Sole member on this host: the family portbase, directly.
        if let Some(proc) = dep.processes.get_mut(process_id) {
            proc.port.set_default(portbase);
        }
        return Ok(Some(portbase));
    }

    let sibling_ports: Vec<u16> = colleagues
        .iter()
        .filter(|p| p.id != process_id)
        .filter_map(|p| p.port.value())
        .collect();
    let any_user_override = colleagues.iter().any(|p| p.port.is_user_set());

    let candidate: u32 = if !any_user_override {
        // Everyone still follows the portbase convention: offset by position
        // in the creation-order colleague list.
        let index = colleagues
            .iter()
            .position(|p| p.id == process_id)
            .unwrap_or(colleagues.len() - 1);
        portbase as u32 + index as u32
    } else {
        // Some siblings were hand-assigned: stack on top of the highest port
        // in use instead of guessing offsets.
        let max = sibling_ports.iter().copied().max().unwrap_or(portbase);
        max as u32 + 1
    };

    if candidate > u16::MAX as u32 {
        warn!(
            process_id,
            %family,
            candidate,
            "port assignment would overflow the valid range, leaving unassigned"
        );
        return Ok(None);
    }
    let candidate = candidate as u16;
    if sibling_ports.contains(&candidate) {
        warn!(
            process_id,
            %family,
            candidate,
            "port collision among colleague processes, leaving unassigned for verification"
        );
        return Ok(None);
    }

    if let Some(proc) = dep.processes.get_mut(process_id) {
        proc.port.set_default(candidate);
    }
    debug!(process_id, %family, port = candidate, "assigned default port");
    Ok(Some(candidate))
}

/// Allocate identity for a freshly created process: node id then port.
pub fn assign_identifiers(
    dep: &mut Deployment,
    process_id: RecordId,
) -> Result<(u64, Option<u16>), AllocError> {
    let node_id = assign_node_id(dep, process_id)?;
    let port = assign_port(dep, process_id)?;
    Ok((node_id, port))
}

/// Create a process and allocate its identity as one step. A failed
/// allocation removes the half-created record again, so the store never
/// retains a process without a node id.
pub fn create_process(
    dep: &mut Deployment,
    name: Option<&str>,
    host_id: RecordId,
    ptype_id: RecordId,
) -> Result<RecordId, AllocError> {
    let process_id = dep.add_process(name, host_id, ptype_id)?;
    if let Err(e) = assign_identifiers(dep, process_id) {
        dep.processes.remove(process_id);
        return Err(e);
    }
    Ok(process_id)
}
