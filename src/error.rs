use std::path::PathBuf;

/// Errors surfaced by the dump path. Instrumentation itself never fails:
/// a scope on a degraded platform records zeros instead of erroring.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tracing is not initialized -- call enable() before dumping")]
    NotInitialized,

    #[error("failed to serialize trace document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write trace to {}: {source}", path.display())]
    DumpWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
