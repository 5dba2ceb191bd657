// THEORY:
// This file is the main entry point for the `cbir` library crate. It follows
// the standard Rust convention of using `lib.rs` to define the public API
// that will be exposed to external consumers (a presentation layer, a batch
// indexer).
//
// The primary goal is to export the `RetrievalService` and its associated
// data structures (`Method`, `RankedResult`, `FeatureStore`) as the clean,
// high-level interface for the retrieval engine. The internal analysis
// modules (`core_modules`) remain accessible for callers that want to work
// with histograms and distances directly, but the intended surface is:
// submit a query image and a method, observe progress, collect the ranked
// list, and optionally resubmit a relevant set for a feedback pass.

pub mod core_modules;
pub mod error;
pub mod service;
pub mod session;

pub use core_modules::feature_store::{FeatureStore, ImageId};
pub use core_modules::histogram::Method;
pub use error::{RetrievalError, Result};
pub use service::{RetrievalService, SessionHandle};
pub use session::{RankedResult, SessionState};
