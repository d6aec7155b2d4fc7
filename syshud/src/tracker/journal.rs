//! Append-only record of what happened during capture, in arrival order

use crate::domain::Pid;
use crate::stackstash::NodeId;
use crate::symbolization::MemoryMapping;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Process { pid: Pid, name: String },
    Map { pid: Pid, mapping: MemoryMapping },
    Fork { parent: Pid, child: Pid },
    Exit { pid: Pid },
    /// Leaf of the raw trace in the tracker's address stash
    Sample { pid: Pid, trace: NodeId },
}

impl JournalEntry {
    #[must_use]
    pub fn pid(&self) -> Pid {
        match self {
            Self::Process { pid, .. }
            | Self::Map { pid, .. }
            | Self::Exit { pid }
            | Self::Sample { pid, .. } => *pid,
            Self::Fork { child, .. } => *child,
        }
    }
}
