//! Error types for CUESYNC
//!
//! Estimation errors stay local, scheduling errors are returned to the
//! submitter, delivery errors become status events, and topology errors are
//! absorbed by re-election.

use std::time::Duration;

use thiserror::Error;

use crate::{CueId, Epoch, NodeId};

/// Cue submission failures, surfaced synchronously
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("No eligible nodes for cue {0}")]
    NoEligibleNodes(CueId),

    #[error("Tolerance {requested:?} is tighter than achievable precision {minimum:?}")]
    InvalidTolerance { requested: Duration, minimum: Duration },

    #[error("Tolerance {requested:?} is wider than the {maximum:?} a dispatch can carry")]
    ToleranceTooLarge { requested: Duration, maximum: Duration },

    #[error("Submissions paused during authority transition (epoch {0})")]
    SubmissionsPaused(Epoch),

    #[error("Cue {0} has an empty payload")]
    EmptyPayload(CueId),

    #[error("Cue {cue} payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { cue: CueId, size: usize, max: usize },

    #[error("Cue id {0} already submitted under a different idempotency key")]
    DuplicateCueId(CueId),
}

/// Transport failures reported by the external transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No route to node {0}")]
    UnknownNode(NodeId),

    #[error("Deadline already passed")]
    DeadlineExceeded,

    #[error("Send buffer full")]
    WouldBlock,

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            TransportError::WouldBlock
        } else {
            TransportError::Io(e.to_string())
        }
    }
}

/// Clock estimation failures; never fatal to the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sample from epoch {sample} does not match current epoch {current}")]
    StaleEpoch { sample: Epoch, current: Epoch },

    #[error("Sample timestamps are not causally ordered")]
    NonCausalSample,
}

/// Capability descriptor resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Unknown cue kind: {0}")]
    UnknownCueKind(String),

    #[error("Capability {0} has the wrong value type")]
    WrongType(String),

    #[error("Capability {0} out of range: {1}")]
    OutOfRange(String, i64),
}

/// Peer registry failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node {0} not registered")]
    UnknownNode(NodeId),

    #[error("Node {0} has departed")]
    Departed(NodeId),

    #[error("Invalid capabilities: {0}")]
    Capabilities(#[from] CapabilityError),
}

/// Wire codec failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Bad magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Unknown cue kind: {0:#04x}")]
    UnknownCueKind(u8),

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),
}

/// Configuration validation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{0}")]
    Inconsistent(String),

    #[error("Invalid duration for {field}: {message}")]
    InvalidDuration { field: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to read configuration: {0}")]
    Io(String),
}

pub type SchedulingResult<T> = Result<T, SchedulingError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type SyncResult<T> = Result<T, SyncError>;
pub type CapabilityResult<T> = Result<T, CapabilityError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
pub type WireResult<T> = Result<T, WireError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
