//! Error type for the windowed sequential pipeline

use outrider_core::TaskError;

/// Error returned by [`Pipeline`](crate::Pipeline) operations.
///
/// All variants except `Build` and `Stopped` are contract violations:
/// the caller asked for something outside the window/monotonicity
/// rules, and no engine state was harmed.
#[derive(Debug)]
pub enum PipelineError {
    /// Requested sequence is beyond the declared maximum.
    AboveMax { sequence: i64, max: i64 },
    /// Requested sequence fell off the low end of the window. Permanent:
    /// evicted results are gone and waiting will not bring them back.
    Evicted { sequence: i64, min: i64 },
    /// Requested sequence is too far ahead of the window; lower
    /// sequences must be consumed first to let the window slide.
    AheadOfWindow { sequence: i64, min: i64, reserved: i64 },
    /// `update_max_sequence` was called with a lower bound than before.
    Regression { sequence: i64, max: i64 },
    /// A sequence inside the window bounds had no cached value. Means
    /// the window invariant was broken, which should never happen.
    MissingEntry { sequence: i64, min: i64, max: i64 },
    /// The pipeline generation was torn down while `get` was waiting.
    Stopped,
    /// The worker factory failed; pool startup was aborted.
    Build(TaskError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AboveMax { sequence, max } => {
                write!(f, "get sequence({sequence}) > max sequence({max})")
            }
            Self::Evicted { sequence, min } => {
                write!(f, "get sequence({sequence}) < min reserved({min})")
            }
            Self::AheadOfWindow {
                sequence,
                min,
                reserved,
            } => write!(
                f,
                "get sequence({sequence}) > min reserved + length({min}+{reserved})"
            ),
            Self::Regression { sequence, max } => write!(
                f,
                "can not set max sequence as {sequence}, while last max sequence is {max}"
            ),
            Self::MissingEntry { sequence, min, max } => write!(
                f,
                "missing {sequence} in reserved window (min {min}, max {max})"
            ),
            Self::Stopped => write!(f, "pipeline stopped"),
            Self::Build(e) => write!(f, "worker build failed: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Build(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
