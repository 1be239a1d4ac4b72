//! Conductor errors

use thiserror::Error;

use cuesync_core::{ConfigError, NodeId, RegistryError, SyncError, TransportError, WireError};
use cuesync_wire::MessageKind;

/// Failures while handling one incoming frame or running the loop.
/// None of them stop the conductor except a closed transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConductorError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unexpected {kind:?} message from node {node}")]
    UnexpectedMessage { kind: MessageKind, node: NodeId },

    #[error("Probe reply {seq} from node {node} matches no outstanding probe")]
    UnknownProbe { seq: u32, node: NodeId },
}

pub type ConductorResult<T> = Result<T, ConductorError>;
