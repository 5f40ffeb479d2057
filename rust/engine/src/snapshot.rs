//! Read-only views of pools and processes.

use parley_types::{Placeholder, ProcName, SessionType, TypeKey};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, ProcessId};
use crate::ledger::{PoolRoot, ProcessRoot, Revision, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot {
    Pool(PoolSnapshot),
    Process(ProcessSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool: PoolRoot,
    pub revision: Revision,
    /// In creation order.
    pub processes: Vec<ProcessSummary>,
}

impl PoolSnapshot {
    /// Processes whose liability is still open.
    pub fn live(&self) -> impl Iterator<Item = &ProcessSummary> {
        self.processes.iter().filter(|p| p.live)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub process_id: ProcessId,
    pub proc_name: ProcName,
    pub parent: Option<ProcessId>,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub process: ProcessRoot,
    pub live: bool,
    /// Live bindings, ordered by placeholder.
    pub bindings: Vec<BindingView>,
    pub children: Vec<ProcessId>,
}

impl ProcessSnapshot {
    #[must_use]
    pub fn binding(&self, placeholder: &str) -> Option<&BindingView> {
        self.bindings.iter().find(|b| b.placeholder == placeholder)
    }
}

/// A live binding with its state spelled out as a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingView {
    pub placeholder: Placeholder,
    pub channel_id: ChannelId,
    pub role: Role,
    pub state: TypeKey,
    pub session: SessionType,
}
