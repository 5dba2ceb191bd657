// THEORY:
// The `session` module is the state machine for one query's lifetime:
//
//     Idle -> Scoring -> Ranked -> (ReScoring -> Ranked)*
//
// A `RankingSession` owns everything one pass needs — the query identifier,
// the method, the user's relevant set, and (in combined mode) the
// standardized feature matrix retained for feedback iterations. The heavy
// work itself lives in the free pass functions (`run_scoring_pass`,
// `run_rescoring_pass`) so a background worker can run them without holding
// the session lock; the worker publishes the finished ranking back into the
// session in one short critical section. Partial results are never
// observable: a pass either publishes a complete sorted list or nothing.
//
// Cancellation and progress travel through the `PassMonitor`, an explicit
// atomic shared-state object with a single-writer (the pass) many-reader
// (the callers) contract. The cancel flag is checked before every per-image
// work unit — both during feature collection and during distance
// computation — and a canceled pass discards its partials and returns the
// session to `Idle`.
//
// Invariants enforced here:
// - The query identifier never appears in the relevant set or in the output.
// - Results are sorted ascending by distance with a stable sort, so ties
//   keep corpus order and identical inputs always produce identical output.
// - Only a combined-mode session in `Ranked` may re-score.

use crate::core_modules::distance::{self, Distance};
use crate::core_modules::feature_store::{FeatureStore, ImageId};
use crate::core_modules::histogram::{BinHistogram, Method};
use crate::core_modules::weights::{
    WeightVector, relevance_weights, standardize_columns, uniform_weights,
};
use crate::error::{RetrievalError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One entry of a published ranking: closer means lower distance.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub id: ImageId,
    pub distance: Distance,
}

/// The observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scoring,
    Ranked,
    ReScoring,
}

/// Shared progress and cancellation state for one pass. The running pass is
/// the only writer of `done`/`total`/`status`; any caller may read them or
/// raise the cancel flag.
pub struct PassMonitor {
    canceled: AtomicBool,
    done: AtomicUsize,
    total: AtomicUsize,
    status: Mutex<String>,
}

impl PassMonitor {
    pub fn new() -> Self {
        Self {
            canceled: AtomicBool::new(false),
            done: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            status: Mutex::new(String::from("idle")),
        }
    }

    /// Arms the monitor for a fresh pass: progress to zero, cancel cleared.
    pub fn begin(&self, status: &str) {
        self.canceled.store(false, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.set_status(status);
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn advance(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap() = status.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    /// Completed fraction in [0, 1].
    pub fn fraction(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let done = self.done.load(Ordering::SeqCst);
        (done as f64 / total as f64).min(1.0)
    }

    pub fn finish(&self, status: &str) {
        let total = self.total.load(Ordering::SeqCst).max(1);
        self.total.store(total, Ordering::SeqCst);
        self.done.store(total, Ordering::SeqCst);
        self.set_status(status);
    }

    /// Clears progress without touching the cancel flag, for a pass that
    /// ended without publishing.
    pub fn reset(&self, status: &str) {
        self.done.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.set_status(status);
    }

    pub fn request_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Default for PassMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// The standardized combined feature matrix retained across feedback
/// iterations. Rows follow corpus order; the query is one of the rows.
#[derive(Debug)]
pub(crate) struct CombinedMatrix {
    pub ids: Vec<ImageId>,
    pub rows: Vec<Vec<f64>>,
    pub query_index: usize,
}

/// The outcome a pass hands back to the worker for publication.
#[derive(Debug)]
pub(crate) enum PassOutcome {
    Ranked(Vec<RankedResult>, Option<CombinedMatrix>),
    Canceled,
}

/// One query's state machine. All mutation happens through short, explicit
/// transitions; the scoring math lives in the pass functions below.
pub struct RankingSession {
    query_id: ImageId,
    method: Method,
    relevant: Vec<ImageId>,
    state: SessionState,
    results: Vec<RankedResult>,
    matrix: Option<Arc<CombinedMatrix>>,
}

impl RankingSession {
    pub fn new(
        query_id: impl Into<ImageId>,
        method: Method,
        relevant: impl IntoIterator<Item = ImageId>,
    ) -> Self {
        let query_id = query_id.into();
        let mut session = Self {
            query_id,
            method,
            relevant: Vec::new(),
            state: SessionState::Idle,
            results: Vec::new(),
            matrix: None,
        };
        session.set_relevant(relevant);
        session
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The current relevant set. The query identifier is stripped on entry:
    /// an image cannot rate itself relevant.
    pub fn relevant_ids(&self) -> &[ImageId] {
        &self.relevant
    }

    pub fn set_relevant(&mut self, relevant: impl IntoIterator<Item = ImageId>) {
        let mut accepted: Vec<ImageId> = Vec::new();
        for id in relevant {
            if id != self.query_id && !accepted.contains(&id) {
                accepted.push(id);
            }
        }
        self.relevant = accepted;
    }

    /// The published ranking, if the session is in `Ranked`.
    pub fn ranked(&self) -> Option<&[RankedResult]> {
        match self.state {
            SessionState::Ranked => Some(&self.results),
            _ => None,
        }
    }

    pub(crate) fn begin_scoring(&mut self) -> Result<()> {
        match self.state {
            SessionState::Scoring | SessionState::ReScoring => Err(RetrievalError::PassInFlight),
            _ => {
                self.state = SessionState::Scoring;
                Ok(())
            }
        }
    }

    pub(crate) fn begin_rescoring(&mut self) -> Result<()> {
        if self.method != Method::Combined {
            return Err(RetrievalError::InvalidTransition(
                "relevance feedback is only available in combined mode",
            ));
        }
        match self.state {
            SessionState::Scoring | SessionState::ReScoring => Err(RetrievalError::PassInFlight),
            SessionState::Ranked => {
                self.state = SessionState::ReScoring;
                Ok(())
            }
            SessionState::Idle => Err(RetrievalError::InvalidTransition(
                "relevance feedback requires a ranked session",
            )),
        }
    }

    pub(crate) fn publish_scoring(
        &mut self,
        results: Vec<RankedResult>,
        matrix: Option<CombinedMatrix>,
    ) {
        self.results = results;
        self.matrix = matrix.map(Arc::new);
        self.state = SessionState::Ranked;
    }

    pub(crate) fn publish_rescoring(&mut self, results: Vec<RankedResult>) {
        self.results = results;
        self.state = SessionState::Ranked;
    }

    /// A failed re-scoring leaves the prior ranking valid and unchanged.
    pub(crate) fn rescoring_failed(&mut self) {
        self.state = SessionState::Ranked;
    }

    /// A canceled or failed pass discards everything and returns to `Idle`.
    pub(crate) fn reset_to_idle(&mut self) {
        self.results.clear();
        self.matrix = None;
        self.state = SessionState::Idle;
    }

    pub(crate) fn matrix(&self) -> Option<Arc<CombinedMatrix>> {
        self.matrix.clone()
    }
}

/// Runs one full scoring pass: feature collection, (for combined mode)
/// matrix standardization and weight derivation, distance computation, and
/// the final stable sort. The query must be a corpus member; it is excluded
/// from the output.
pub(crate) fn run_scoring_pass(
    query_id: &str,
    method: Method,
    relevant: &[ImageId],
    store: &Mutex<FeatureStore>,
    monitor: &PassMonitor,
) -> Result<PassOutcome> {
    let ids = store.lock().unwrap().corpus_ids().to_vec();
    let query_index = ids
        .iter()
        .position(|id| id == query_id)
        .ok_or_else(|| RetrievalError::NotFound {
            id: query_id.to_string(),
            method,
        })?;

    // One unit for collecting each image's features, one for each distance.
    monitor.set_total(ids.len() * 2);

    match method {
        Method::Intensity | Method::ColorCode => {
            let mut histograms: Vec<BinHistogram> = Vec::with_capacity(ids.len());
            for id in &ids {
                if monitor.cancel_requested() {
                    return Ok(PassOutcome::Canceled);
                }
                monitor.set_status(format!("processing image {id}..."));
                let histogram = {
                    let mut store = store.lock().unwrap();
                    match method {
                        Method::Intensity => store.intensity_histogram(id)?,
                        Method::ColorCode => store.color_code_histogram(id)?,
                        Method::Combined => unreachable!(),
                    }
                };
                histograms.push(histogram);
                monitor.advance();
            }

            let query_histogram = histograms[query_index].clone();
            let mut results = Vec::with_capacity(ids.len().saturating_sub(1));
            monitor.set_status("calculating distances...");
            for (index, (id, histogram)) in ids.iter().zip(&histograms).enumerate() {
                if monitor.cancel_requested() {
                    return Ok(PassOutcome::Canceled);
                }
                if index != query_index {
                    results.push(RankedResult {
                        id: id.clone(),
                        distance: distance::normalized_l1(&query_histogram, histogram),
                    });
                }
                monitor.advance();
            }
            sort_ranked(&mut results);
            Ok(PassOutcome::Ranked(results, None))
        }
        Method::Combined => {
            let mut rows: Vec<Vec<f64>> = Vec::with_capacity(ids.len());
            for id in &ids {
                if monitor.cancel_requested() {
                    return Ok(PassOutcome::Canceled);
                }
                monitor.set_status(format!("processing image {id}..."));
                let row = store.lock().unwrap().combined_features(id)?;
                rows.push(row);
                monitor.advance();
            }
            standardize_columns(&mut rows);

            let matrix = CombinedMatrix {
                ids,
                rows,
                query_index,
            };
            let weights = combined_weights(&matrix, relevant)?;
            match score_matrix(&matrix, &weights, monitor) {
                Some(results) => Ok(PassOutcome::Ranked(results, Some(matrix))),
                None => Ok(PassOutcome::Canceled),
            }
        }
    }
}

/// Re-scores an already-built combined matrix with weights recomputed from
/// the current relevant set.
pub(crate) fn run_rescoring_pass(
    matrix: &CombinedMatrix,
    relevant: &[ImageId],
    monitor: &PassMonitor,
) -> Result<PassOutcome> {
    let indices = resolve_relevant(matrix, relevant);
    let weights = relevance_weights(&matrix.rows, &indices)?;
    monitor.set_total(matrix.ids.len());
    match score_matrix(matrix, &weights, monitor) {
        Some(results) => Ok(PassOutcome::Ranked(results, None)),
        None => Ok(PassOutcome::Canceled),
    }
}

/// Weight selection for a combined pass: uniform until the caller has marked
/// relevant images, statistics-driven afterwards.
fn combined_weights(matrix: &CombinedMatrix, relevant: &[ImageId]) -> Result<WeightVector> {
    if relevant.is_empty() {
        return Ok(uniform_weights(matrix.rows[matrix.query_index].len()));
    }
    let indices = resolve_relevant(matrix, relevant);
    relevance_weights(&matrix.rows, &indices)
}

/// Maps relevant identifiers to matrix row indices. Unknown identifiers and
/// the query row itself are dropped.
pub(crate) fn resolve_relevant(matrix: &CombinedMatrix, relevant: &[ImageId]) -> Vec<usize> {
    relevant
        .iter()
        .filter_map(|id| matrix.ids.iter().position(|corpus_id| corpus_id == id))
        .filter(|&index| index != matrix.query_index)
        .collect()
}

/// Weighted distances from the query row to every other row, sorted. Returns
/// `None` when canceled mid-loop.
fn score_matrix(
    matrix: &CombinedMatrix,
    weights: &[f64],
    monitor: &PassMonitor,
) -> Option<Vec<RankedResult>> {
    let query_row = &matrix.rows[matrix.query_index];
    let mut results = Vec::with_capacity(matrix.ids.len().saturating_sub(1));
    monitor.set_status("calculating distances...");
    for (index, (id, row)) in matrix.ids.iter().zip(&matrix.rows).enumerate() {
        if monitor.cancel_requested() {
            return None;
        }
        if index != matrix.query_index {
            results.push(RankedResult {
                id: id.clone(),
                distance: distance::weighted_l1(query_row, row, weights),
            });
        }
        monitor.advance();
    }
    sort_ranked(&mut results);
    Some(results)
}

/// Ascending by distance. The sort is stable, so equal distances keep their
/// corpus order and identical inputs always rank identically.
fn sort_ranked(results: &mut [RankedResult]) {
    results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::histogram::{COLOR_CODE_BIN_COUNT, INTENSITY_BIN_COUNT};
    use std::fs;
    use std::path::Path;

    fn write_table(path: &Path, rows: &[(&str, Vec<u64>)]) {
        let mut table = String::new();
        for (id, counts) in rows {
            table.push_str(id);
            for count in counts {
                table.push(',');
                table.push_str(&count.to_string());
            }
            table.push('\n');
        }
        fs::write(path, table).unwrap();
    }

    fn counts(filled: &[(usize, u64)], columns: usize) -> Vec<u64> {
        let mut row = vec![0u64; columns];
        for &(bin, count) in filled {
            row[bin] = count;
        }
        row
    }

    /// Corpus from the three-image scenario: images 1 and 2 share a
    /// distribution, image 3 is disjoint.
    fn three_image_store(dir: &Path) -> Mutex<FeatureStore> {
        let table = dir.join("intensity.csv");
        write_table(
            &table,
            &[
                ("1", counts(&[(0, 10)], INTENSITY_BIN_COUNT)),
                ("2", counts(&[(0, 10)], INTENSITY_BIN_COUNT)),
                ("3", counts(&[(1, 10)], INTENSITY_BIN_COUNT)),
            ],
        );
        let mut store = FeatureStore::new();
        store.load_intensity_table(&table).unwrap();
        Mutex::new(store)
    }

    fn combined_store(dir: &Path) -> Mutex<FeatureStore> {
        let intensity = dir.join("intensity.csv");
        let color_code = dir.join("color_code.csv");
        write_table(
            &intensity,
            &[
                ("1", counts(&[(0, 8), (1, 2)], INTENSITY_BIN_COUNT)),
                ("2", counts(&[(0, 7), (1, 3)], INTENSITY_BIN_COUNT)),
                ("3", counts(&[(5, 10)], INTENSITY_BIN_COUNT)),
                ("4", counts(&[(0, 6), (2, 4)], INTENSITY_BIN_COUNT)),
            ],
        );
        write_table(
            &color_code,
            &[
                ("1", counts(&[(48, 10)], COLOR_CODE_BIN_COUNT)),
                ("2", counts(&[(48, 9), (3, 1)], COLOR_CODE_BIN_COUNT)),
                ("3", counts(&[(12, 10)], COLOR_CODE_BIN_COUNT)),
                ("4", counts(&[(48, 5), (12, 5)], COLOR_CODE_BIN_COUNT)),
            ],
        );
        let mut store = FeatureStore::new();
        store.load_intensity_table(&intensity).unwrap();
        store.load_color_code_table(&color_code).unwrap();
        Mutex::new(store)
    }

    fn ranked(outcome: PassOutcome) -> Vec<RankedResult> {
        match outcome {
            PassOutcome::Ranked(results, _) => results,
            PassOutcome::Canceled => panic!("pass was canceled"),
        }
    }

    #[test]
    fn session_strips_query_from_relevant_set() {
        let session = RankingSession::new(
            "1",
            Method::Combined,
            vec!["1".to_string(), "2".to_string(), "2".to_string()],
        );
        assert_eq!(session.relevant_ids(), ["2".to_string()]);
    }

    #[test]
    fn identical_image_ranks_first_with_zero_distance() {
        let dir = tempfile::tempdir().unwrap();
        let store = three_image_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");

        let results = ranked(
            run_scoring_pass("1", Method::Intensity, &[], &store, &monitor).unwrap(),
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "2");
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(results[1].id, "3");
        assert!(results[1].distance > 0.0);
    }

    #[test]
    fn query_is_excluded_from_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = three_image_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");

        let results = ranked(
            run_scoring_pass("2", Method::Intensity, &[], &store, &monitor).unwrap(),
        );
        assert!(results.iter().all(|r| r.id != "2"));
    }

    #[test]
    fn rerunning_identical_inputs_gives_identical_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let store = combined_store(dir.path());
        let monitor = PassMonitor::new();
        let relevant = vec!["2".to_string(), "4".to_string()];

        monitor.begin("scoring");
        let first = ranked(
            run_scoring_pass("1", Method::Combined, &relevant, &store, &monitor).unwrap(),
        );
        monitor.begin("scoring");
        let second = ranked(
            run_scoring_pass("1", Method::Combined, &relevant, &store, &monitor).unwrap(),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn equal_distances_keep_corpus_order() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("intensity.csv");
        // Images 2 and 3 are identical, so both sit at the same distance
        // from the query.
        write_table(
            &table,
            &[
                ("1", counts(&[(0, 10)], INTENSITY_BIN_COUNT)),
                ("2", counts(&[(1, 10)], INTENSITY_BIN_COUNT)),
                ("3", counts(&[(1, 10)], INTENSITY_BIN_COUNT)),
            ],
        );
        let mut store = FeatureStore::new();
        store.load_intensity_table(&table).unwrap();
        let store = Mutex::new(store);

        let monitor = PassMonitor::new();
        monitor.begin("scoring");
        let results = ranked(
            run_scoring_pass("1", Method::Intensity, &[], &store, &monitor).unwrap(),
        );
        assert_eq!(results[0].id, "2");
        assert_eq!(results[1].id, "3");
        assert_eq!(results[0].distance, results[1].distance);
    }

    #[test]
    fn unknown_query_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = three_image_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");

        match run_scoring_pass("99", Method::Intensity, &[], &store, &monitor) {
            Err(RetrievalError::NotFound { id, .. }) => assert_eq!(id, "99"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn canceled_monitor_stops_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let store = three_image_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");
        monitor.request_cancel();

        match run_scoring_pass("1", Method::Intensity, &[], &store, &monitor).unwrap() {
            PassOutcome::Canceled => {}
            PassOutcome::Ranked(..) => panic!("canceled pass must not publish"),
        }
    }

    #[test]
    fn single_relevant_image_fails_without_a_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let store = combined_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");

        let relevant = vec!["2".to_string()];
        match run_scoring_pass("1", Method::Combined, &relevant, &store, &monitor) {
            Err(RetrievalError::InsufficientRelevantSet { found: 1 }) => {}
            other => panic!("expected InsufficientRelevantSet, got {other:?}"),
        }
    }

    #[test]
    fn rescoring_reuses_the_matrix_with_new_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = combined_store(dir.path());
        let monitor = PassMonitor::new();
        monitor.begin("scoring");

        let outcome = run_scoring_pass("1", Method::Combined, &[], &store, &monitor).unwrap();
        let PassOutcome::Ranked(initial, Some(matrix)) = outcome else {
            panic!("expected a ranked combined pass with a retained matrix");
        };

        monitor.begin("rescoring");
        let relevant = vec!["2".to_string(), "4".to_string()];
        let rescored = ranked(run_rescoring_pass(&matrix, &relevant, &monitor).unwrap());
        assert_eq!(rescored.len(), initial.len());
        assert!(rescored.iter().all(|r| r.distance >= 0.0));
        assert!(rescored.iter().all(|r| r.id != "1"));
    }

    #[test]
    fn rescoring_transition_requires_combined_ranked() {
        let mut session = RankingSession::new("1", Method::Intensity, Vec::new());
        assert!(matches!(
            session.begin_rescoring(),
            Err(RetrievalError::InvalidTransition(_))
        ));

        let mut session = RankingSession::new("1", Method::Combined, Vec::new());
        assert!(matches!(
            session.begin_rescoring(),
            Err(RetrievalError::InvalidTransition(_))
        ));
        session.begin_scoring().unwrap();
        assert!(matches!(
            session.begin_rescoring(),
            Err(RetrievalError::PassInFlight)
        ));
        session.publish_scoring(Vec::new(), None);
        session.begin_rescoring().unwrap();
    }
}
