use crate::order::PeerId;
use crate::sync::ProcessState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad setup: unknown peer id, service time below its floor, ...
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Operation invoked while the state machine was in the wrong state.
    #[error("{op} not allowed while {state:?}")]
    ProtocolViolation {
        op: &'static str,
        state: ProcessState,
    },
    /// Two occupants at once. Only happens if the mutex protocol is broken.
    #[error("resource already in use")]
    ResourceBusy,
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: PeerId, reason: String },
    #[error("deadline passed before all replies arrived")]
    Timeout,
    #[error("malformed payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("remote error: {0}")]
    Remote(String),
}
