//! Derived hierarchical views of the deployment.
//!
//! Two projections are kept in sync with the entity tables: hosts with their
//! processes, and family nodes with theirs. Pure bookkeeping — the invariant
//! is that after any sequence of create/rename/delete operations each live
//! process appears exactly once under its host and exactly once under its
//! family, and nothing else does.

use crate::models::{Family, ProcessStatus, RecordId};
use crate::store::Deployment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeLeaf {
    pub process_id: RecordId,
    pub name: String,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostNode {
    pub host_id: RecordId,
    pub name: String,
    pub children: Vec<TreeLeaf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyNode {
    pub family: Family,
    pub children: Vec<TreeLeaf>,
}

/// Which panel a selection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Panel {
    Hosts,
    Families,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trees {
    pub hosts: Vec<HostNode>,
    pub families: Vec<FamilyNode>,
    /// Process leaf currently selected in the host panel, if any.
    pub host_panel_selection: Option<RecordId>,
    /// Process leaf currently selected in the family panel, if any.
    pub family_panel_selection: Option<RecordId>,
}

impl Trees {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            families: [Family::Management, Family::Data, Family::Sql, Family::Api]
                .into_iter()
                .map(|family| FamilyNode { family, children: Vec::new() })
                .collect(),
            host_panel_selection: None,
            family_panel_selection: None,
        }
    }

    /// Rebuild both projections from scratch. Used at startup after loading
    /// a snapshot; steady-state maintenance is incremental.
    pub fn rebuild(dep: &Deployment) -> Self {
        let mut trees = Self::new();
        for host in dep.hosts.iter() {
            trees.add_host(host.id, &host.name);
        }
        for proc in dep.processes.iter() {
            if let Some(family) = dep.family_of(proc) {
                trees.add_process(proc.id, &proc.name, proc.status, proc.host_id, family);
            }
        }
        trees
    }

    pub fn add_host(&mut self, host_id: RecordId, name: &str) {
        if self.hosts.iter().any(|h| h.host_id == host_id) {
            return;
        }
        self.hosts.push(HostNode { host_id, name: name.to_string(), children: Vec::new() });
    }

    /// Drop a host node along with all its leaves (the store has already
    /// cascaded the processes).
    pub fn remove_host(&mut self, host_id: RecordId) {
        let Some(pos) = self.hosts.iter().position(|h| h.host_id == host_id) else {
            return;
        };
        let node = self.hosts.remove(pos);
        for leaf in node.children {
            self.remove_process(leaf.process_id);
        }
    }

    pub fn add_process(
        &mut self,
        process_id: RecordId,
        name: &str,
        status: ProcessStatus,
        host_id: RecordId,
        family: Family,
    ) {
        let leaf = TreeLeaf { process_id, name: name.to_string(), status };
        if let Some(host) = self.hosts.iter_mut().find(|h| h.host_id == host_id) {
            if !host.children.iter().any(|l| l.process_id == process_id) {
                host.children.push(leaf.clone());
            }
        }
        if let Some(node) = self.families.iter_mut().find(|f| f.family == family) {
            if !node.children.iter().any(|l| l.process_id == process_id) {
                node.children.push(leaf);
            }
        }
    }

    /// Propagate a rename to both projections.
    pub fn rename_process(&mut self, process_id: RecordId, name: &str) {
        for leaf in self.leaves_mut(process_id) {
            leaf.name = name.to_string();
        }
    }

    pub fn set_process_status(&mut self, process_id: RecordId, status: ProcessStatus) {
        for leaf in self.leaves_mut(process_id) {
            leaf.status = status;
        }
    }

    /// Remove both leaves of a process; a selection pointing at the removed
    /// leaf is reset.
    pub fn remove_process(&mut self, process_id: RecordId) {
        for host in &mut self.hosts {
            host.children.retain(|l| l.process_id != process_id);
        }
        for node in &mut self.families {
            node.children.retain(|l| l.process_id != process_id);
        }
        if self.host_panel_selection == Some(process_id) {
            self.host_panel_selection = None;
        }
        if self.family_panel_selection == Some(process_id) {
            self.family_panel_selection = None;
        }
    }

    pub fn select(&mut self, panel: Panel, process_id: Option<RecordId>) {
        match panel {
            Panel::Hosts => self.host_panel_selection = process_id,
            Panel::Families => self.family_panel_selection = process_id,
        }
    }

    fn leaves_mut(&mut self, process_id: RecordId) -> Vec<&mut TreeLeaf> {
        let mut leaves = Vec::new();
        for host in &mut self.hosts {
            leaves.extend(host.children.iter_mut().filter(|l| l.process_id == process_id));
        }
        for node in &mut self.families {
            leaves.extend(node.children.iter_mut().filter(|l| l.process_id == process_id));
        }
        leaves
    }

    /// Check the projection invariant against the store: every live process
    /// exactly once under the right host, exactly once under the right
    /// family, and no stray leaves.
    pub fn verify(&self, dep: &Deployment) -> bool {
        let mut host_leaves = 0usize;
        let mut family_leaves = 0usize;
        for proc in dep.processes.iter() {
            let Some(family) = dep.family_of(proc) else { return false };
            let under_host = self
                .hosts
                .iter()
                .filter(|h| h.host_id == proc.host_id)
                .flat_map(|h| &h.children)
                .filter(|l| l.process_id == proc.id)
                .count();
            let under_family = self
                .families
                .iter()
                .filter(|f| f.family == family)
                .flat_map(|f| &f.children)
                .filter(|l| l.process_id == proc.id)
                .count();
            if under_host != 1 || under_family != 1 {
                return false;
            }
            host_leaves += 1;
            family_leaves += 1;
        }
        let total_host = self.hosts.iter().map(|h| h.children.len()).sum::<usize>();
        let total_family = self.families.iter().map(|f| f.children.len()).sum::<usize>();
        total_host == host_leaves && total_family == family_leaves
    }
}
