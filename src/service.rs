// THEORY:
// The `service` module is the engine's front door for external collaborators
// (a presentation layer, a batch runner). It keeps the caller's control path
// free of heavy work: submitting a query spawns a single background worker
// that runs the whole extraction/scoring pass, and the caller only observes
// progress, cancels, or collects the published ranking.
//
// Key architectural principles:
// 1.  **Single worker per pass**: exactly one task owns a session's feature
//     matrix and relevant set for the duration of a pass. A second
//     submission on the same session while one is in flight is rejected,
//     never interleaved.
// 2.  **Publish-at-end**: the worker computes into its own locals and takes
//     the session lock only for the final publication, so observers never
//     see a half-populated or half-sorted list and progress reads never
//     block on scoring.
// 3.  **Cooperative cancellation**: `cancel` raises an atomic flag that the
//     pass checks at per-image granularity. A canceled pass discards its
//     partials and the session returns to `Idle`. Canceling again — or
//     canceling a session with no pass running — is a no-op.
// 4.  **Deferred errors**: a pass failure (undecodable image, missing store
//     row) aborts the pass and is handed to the caller on the next result
//     request, since the submitting call has long returned.

use crate::core_modules::feature_store::{FeatureStore, ImageId};
use crate::core_modules::histogram::Method;
use crate::error::{RetrievalError, Result};
use crate::session::{
    PassMonitor, PassOutcome, RankedResult, RankingSession, SessionState, resolve_relevant,
    run_rescoring_pass, run_scoring_pass,
};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Shared state between a session's callers and its background worker.
struct SessionShared {
    session: Mutex<RankingSession>,
    monitor: PassMonitor,
    /// The failure of the most recent pass, handed out once.
    last_error: Mutex<Option<RetrievalError>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A caller's handle to one ranking session. Cheap to clone; the session
/// lives as long as any handle does.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.session.lock().unwrap().state()
    }

    pub fn query_id(&self) -> ImageId {
        self.shared.session.lock().unwrap().query_id().to_string()
    }

    pub fn method(&self) -> Method {
        self.shared.session.lock().unwrap().method()
    }
}

/// The retrieval engine's external interface. Owns the feature store shared
/// by all sessions.
pub struct RetrievalService {
    store: Arc<Mutex<FeatureStore>>,
}

impl RetrievalService {
    pub fn new(store: FeatureStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Submits a query and starts its scoring pass on a background worker.
    /// The relevant set, when supplied from a prior session, seeds the
    /// combined method's weights immediately.
    pub fn submit_query(
        &self,
        query_id: impl Into<ImageId>,
        method: Method,
        relevant: Option<Vec<ImageId>>,
    ) -> SessionHandle {
        let query_id = query_id.into();
        info!("submitting {method} query for image {query_id}");

        let mut session = RankingSession::new(query_id, method, relevant.unwrap_or_default());
        // A fresh session is always Idle, so this transition cannot fail.
        session
            .begin_scoring()
            .expect("fresh session must accept a scoring pass");

        let shared = Arc::new(SessionShared {
            session: Mutex::new(session),
            monitor: PassMonitor::new(),
            last_error: Mutex::new(None),
            worker: Mutex::new(None),
        });
        shared.monitor.begin("collecting features...");

        let worker_shared = Arc::clone(&shared);
        let store = Arc::clone(&self.store);
        let worker = tokio::spawn(async move {
            let (query_id, method, relevant) = {
                let session = worker_shared.session.lock().unwrap();
                (
                    session.query_id().to_string(),
                    session.method(),
                    session.relevant_ids().to_vec(),
                )
            };
            let outcome =
                run_scoring_pass(&query_id, method, &relevant, &store, &worker_shared.monitor);
            publish_outcome(&worker_shared, outcome, false);
        });
        *shared.worker.lock().unwrap() = Some(worker);

        SessionHandle { shared }
    }

    /// Completed fraction in [0, 1] plus a status string for display.
    pub fn get_progress(&self, handle: &SessionHandle) -> (f64, String) {
        (
            handle.shared.monitor.fraction(),
            handle.shared.monitor.status(),
        )
    }

    /// Requests cooperative cancellation of the in-flight pass. Idempotent;
    /// a session with no running pass is unaffected.
    pub fn cancel(&self, handle: &SessionHandle) {
        handle.shared.monitor.request_cancel();
    }

    /// The published ranking, query excluded. Reports the pass failure
    /// instead when the last pass aborted, and `NoResult` while no ranking
    /// is available.
    pub fn get_ranked_result(&self, handle: &SessionHandle) -> Result<Vec<RankedResult>> {
        let session = handle.shared.session.lock().unwrap();
        if let Some(results) = session.ranked() {
            return Ok(results.to_vec());
        }
        drop(session);
        if let Some(error) = handle.shared.last_error.lock().unwrap().take() {
            return Err(error);
        }
        Err(RetrievalError::NoResult)
    }

    /// Starts a re-scoring pass with an updated relevant set. Only valid on
    /// a combined-mode session in `Ranked`; an insufficient relevant set is
    /// reported immediately and leaves the prior ranking untouched.
    pub fn resubmit_relevance(
        &self,
        handle: &SessionHandle,
        relevant: Vec<ImageId>,
    ) -> Result<()> {
        let matrix = {
            let mut session = handle.shared.session.lock().unwrap();
            session.begin_rescoring()?;
            session.set_relevant(relevant);

            let Some(matrix) = session.matrix() else {
                session.rescoring_failed();
                return Err(RetrievalError::InvalidTransition(
                    "no feature matrix retained for this session",
                ));
            };
            let resolved = resolve_relevant(matrix.as_ref(), session.relevant_ids());
            if resolved.len() < 2 {
                session.rescoring_failed();
                return Err(RetrievalError::InsufficientRelevantSet {
                    found: resolved.len(),
                });
            }
            matrix
        };
        info!("re-scoring session for image {}", handle.query_id());
        handle.shared.monitor.begin("recalculating weights...");

        let worker_shared = Arc::clone(&handle.shared);
        let worker = tokio::spawn(async move {
            let relevant = {
                let session = worker_shared.session.lock().unwrap();
                session.relevant_ids().to_vec()
            };
            let outcome = run_rescoring_pass(matrix.as_ref(), &relevant, &worker_shared.monitor);
            publish_outcome(&worker_shared, outcome, true);
        });
        *handle.shared.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    /// Blocks until the in-flight pass (if any) has published, then returns
    /// the ranking. This is the one intended suspension point for callers.
    pub async fn wait_for_result(&self, handle: &SessionHandle) -> Result<Vec<RankedResult>> {
        let worker = handle.shared.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.get_ranked_result(handle)
    }
}

/// Publishes a finished pass into the session in one short critical
/// section. A cancel that raced the final work unit still wins: nothing is
/// published after the flag is up.
fn publish_outcome(
    shared: &SessionShared,
    outcome: Result<PassOutcome>,
    rescoring: bool,
) {
    let mut session = shared.session.lock().unwrap();
    match outcome {
        Ok(PassOutcome::Ranked(results, matrix)) => {
            if shared.monitor.cancel_requested() {
                session.reset_to_idle();
                shared.monitor.reset("canceled");
            } else if rescoring {
                session.publish_rescoring(results);
                shared.monitor.finish("ranked");
            } else {
                session.publish_scoring(results, matrix);
                shared.monitor.finish("ranked");
            }
        }
        Ok(PassOutcome::Canceled) => {
            session.reset_to_idle();
            shared.monitor.reset("canceled");
        }
        Err(error) => {
            warn!("scoring pass for image {} failed: {error}", session.query_id());
            if rescoring {
                session.rescoring_failed();
            } else {
                session.reset_to_idle();
            }
            *shared.last_error.lock().unwrap() = Some(error);
            shared.monitor.reset("failed");
        }
    }
}
