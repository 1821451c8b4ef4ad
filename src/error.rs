// Copyright 2021 Stratus Data Systems, Inc.

//! Engine error taxonomy. Peer-visible rejections (`Unauth`, a feed that
//! isn't multicast) travel inside `SubscriptionReply` and are not errors
//! here; this module covers the fault paths that unwind resources or kill
//! the session.

use std::io;

use thiserror::Error;

use crate::types::Feed;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad argument from the caller.
    #[error("invalid argument: {0}")]
    Inval(String),

    /// Invariant violation. Should never occur in steady state.
    #[error("logic error: {0}")]
    Logic(String),

    /// Requested item is missing.
    #[error("no such entry: {0}")]
    NoEnt(String),

    /// Conflicting registration.
    #[error("conflicting registration: {0}")]
    Dup(String),

    /// Policy rejection.
    #[error("not authorized: {0}")]
    Unauth(String),

    /// Multicast-layer failure.
    #[error("multicast layer: {0}")]
    Mcast(String),

    /// Product-queue failure.
    #[error("product queue: {0}")]
    Pq(#[from] PqError),

    /// Anything else.
    #[error("system error: {0}")]
    System(String),
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::System(err.to_string())
    }
}

/// Errors from the product-queue reader.
#[derive(Debug, Error)]
pub enum PqError {
    #[error("no such product in queue")]
    NotFound,

    #[error("product queue not writable")]
    ReadOnly,

    #[error("product queue is corrupt: {0}")]
    Corrupt(String),

    #[error("product queue I/O: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the product-index map.
#[derive(Debug, Error)]
pub enum PimError {
    #[error("no signature for index {0}")]
    NoEnt(u64),

    #[error("another reader holds the product-index map for feed {0}")]
    Busy(Feed),

    #[error("product-index map is corrupt: {0}")]
    Corrupt(String),

    #[error("product-index map I/O: {0}")]
    Io(#[from] io::Error),
}

impl From<PimError> for EngineError {
    fn from(err: PimError) -> Self {
        match err {
            PimError::NoEnt(index) => {
                EngineError::NoEnt(format!("product index {}", index))
            }
            other => EngineError::System(other.to_string()),
        }
    }
}
