//! Structured error types for syshud
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only setup failures are fatal; everything on the capture and resolution
//! paths degrades to a placeholder instead of surfacing one of these.

use super::types::CpuId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to set up performance counter on {cpu}: {reason}")]
    SetupFailed { cpu: CpuId, reason: String },

    #[error("No online CPUs found")]
    NoCpus,

    #[error("Collector is still running; stop() it before creating a profile")]
    NotStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("Malformed ELF image: {0}")]
    Parse(String),

    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProfileFileError {
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Missing <{0}> element")]
    MissingField(&'static str),

    #[error("Node {node} refers to unknown {kind} id {id}")]
    DanglingReference { node: u64, kind: &'static str, id: u64 },

    #[error("Node {0} is part of a parent cycle")]
    ParentCycle(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
