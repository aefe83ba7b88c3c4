use std::io;

use thiserror::Error;

/// Central error type for the etude socket engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection pool has no free slot and is not allowed to grow.
    #[error("connection pool exhausted (capacity {0})")]
    PoolExhausted(usize),

    /// `initialize_subprocess` has not run yet.
    #[error("engine is not initialized")]
    NotInitialized,

    /// An initialization step was invoked twice.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// A background thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
