// THEORY:
// The `error` module defines the complete failure taxonomy of the retrieval
// engine. The guiding rule is severity-based: anything that breaks the
// alignment of the corpus feature matrix (an undecodable image, a missing
// store row) aborts the whole scoring pass, because a ranking computed over a
// partial matrix would silently compare the wrong rows. Caller mistakes that
// leave the session in a consistent state (too few relevant images, asking
// for a result too early) are ordinary recoverable errors. Dimension
// mismatches between feature vectors and weight vectors are programming
// errors and panic instead of appearing here. Numeric degeneracy (zero or
// near-zero standard deviations) is never an error at all; it is absorbed by
// the deterministic substitution rules in the `weights` module.

use crate::core_modules::histogram::Method;
use thiserror::Error;

/// All recoverable failures the retrieval engine can report.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The image file exists but could not be decoded.
    #[error("failed to decode image at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    /// The image decoded successfully but contains zero pixels.
    #[error("image at {path} contains no pixels")]
    EmptyImage { path: String },

    /// No precomputed features for this identifier and no fallback
    /// extraction path is configured.
    #[error("no {method} features stored for image {id} and no fallback image directory is configured")]
    NotFound { id: String, method: Method },

    /// A persisted feature table could not be read or has a malformed row.
    #[error("feature table {path}, line {line}: {reason}")]
    Store {
        path: String,
        line: usize,
        reason: String,
    },

    /// Relevance feedback needs at least two relevant images to estimate a
    /// standard deviation. The prior ranking is left untouched.
    #[error("relevance feedback requires at least 2 relevant images, got {found}")]
    InsufficientRelevantSet { found: usize },

    /// A scoring or re-scoring pass is already running on this session.
    #[error("a scoring pass is already in flight on this session")]
    PassInFlight,

    /// The session has no published ranking to return.
    #[error("no ranked result is available for this session")]
    NoResult,

    /// The requested operation is not valid for the session's method or
    /// current state.
    #[error("invalid session transition: {0}")]
    InvalidTransition(&'static str),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
