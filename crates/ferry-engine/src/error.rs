use ferry_core::eid::EidError;
use ferry_core::wire::WireError;

/// Storage and transaction failures. Any of these cancels the enclosing
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("no such list {0}")]
    NoSuchList(u64),
    #[error("no such list element {0}")]
    NoSuchElt(u64),
    #[error("no such object {0}")]
    NoSuchObject(u64),
    #[error("timeline index refused {0}")]
    Index(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Eid(#[from] EidError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown plan {0}")]
    UnknownPlan(String),
    #[error("unknown scheme {0}")]
    UnknownScheme(String),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error("unknown outduct {0}")]
    UnknownOutduct(String),
    #[error("duplicate {0}")]
    Duplicate(String),
    #[error("clone range {offset}+{length} exceeds payload of {payload} bytes")]
    BadCloneRange { offset: u64, length: u64, payload: u64 },
    #[error("invalid send request: {0}")]
    InvalidSend(&'static str),
    #[error("endpoint {0} is already open")]
    EndpointBusy(String),
    #[error("endpoint {0} is not open")]
    EndpointClosed(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
