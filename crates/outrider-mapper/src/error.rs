//! Error type for the parallel batch mapper

use outrider_core::TaskError;

/// Error returned by [`Mapper::get`](crate::Mapper::get).
#[derive(Debug)]
pub enum MapperError {
    /// A previous `get` on this instance has not returned yet.
    InUse,
    /// The worker factory failed; no chunk was processed.
    Build(TaskError),
    /// A chunk kept failing until its retry budget ran out.
    Chunk {
        start: usize,
        end: usize,
        total: usize,
        attempts: u32,
        source: TaskError,
    },
    /// Every worker exited before the batch completed.
    PoolStopped,
}

impl std::fmt::Display for MapperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InUse => write!(f, "in use"),
            Self::Build(e) => write!(f, "worker build failed: {e}"),
            Self::Chunk {
                start,
                end,
                total,
                attempts,
                source,
            } => write!(
                f,
                "chunk {start}~{end} of {total} failed after {attempts} attempts: {source}"
            ),
            Self::PoolStopped => write!(f, "worker pool exited before the batch completed"),
        }
    }
}

impl std::error::Error for MapperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Build(e) => Some(e.as_ref()),
            Self::Chunk { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
