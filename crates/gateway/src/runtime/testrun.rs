//! The activation test runner.
//!
//! Each test case runs one chat turn in a throwaway test-origin session
//! and passes when the traces captured during the turn cover every
//! expected symbol activation. Comparison runs additionally collect a
//! baseline (no-tools) response and a judged evaluation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use sz_domain::auth::AuthContext;
use sz_domain::context::{SessionType, TurnRole};
use sz_domain::testset::{
    CaseResult, CaseStatus, TestCase, TestRun, TestRunStatus, TestSet,
};
use sz_domain::{Error, Result};
use sz_store::KvStore;

use crate::runtime::turn::{self, TurnRequest};
use crate::state::AppState;

const TEST_SETS_SET: &str = "sz:test_sets";
const TEST_RUNS_SET: &str = "sz:test_runs";
const UPDATE_RETRIES: usize = 16;

fn set_key(id: &str) -> String {
    format!("sz:test_set:{id}")
}

fn run_key(id: &str) -> String {
    format!("sz:test_run:{id}")
}

pub struct TestService {
    kv: Arc<dyn KvStore>,
}

impl TestService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    // ── Test sets ─────────────────────────────────────────────────

    pub async fn create_set(&self, name: &str, tests: Vec<TestCase>) -> Result<TestSet> {
        if name.trim().is_empty() {
            return Err(Error::InvalidRequest("test set name is required".into()));
        }
        let now = Utc::now();
        let set = TestSet {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            tests,
            created_at: now,
            updated_at: now,
        };
        self.save_set(&set).await?;
        Ok(set)
    }

    pub async fn list_sets(&self) -> Result<Vec<TestSet>> {
        let mut ids = self.kv.smembers(TEST_SETS_SET).await?;
        ids.sort();
        let mut sets = Vec::new();
        for id in ids {
            if let Ok(set) = self.get_set(&id).await {
                sets.push(set);
            }
        }
        Ok(sets)
    }

    pub async fn get_set(&self, id: &str) -> Result<TestSet> {
        let raw = self
            .kv
            .get(&set_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("test set {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    pub async fn delete_set(&self, id: &str) -> Result<()> {
        if !self.kv.del(&set_key(id)).await? {
            return Err(Error::NotFound(format!("test set {id}")));
        }
        self.kv.srem(TEST_SETS_SET, id).await?;
        Ok(())
    }

    /// Swap the whole table (project import).
    pub async fn replace_all_sets(&self, sets: Vec<TestSet>) -> Result<()> {
        for id in self.kv.smembers(TEST_SETS_SET).await? {
            self.kv.del(&set_key(&id)).await?;
            self.kv.srem(TEST_SETS_SET, &id).await?;
        }
        for set in sets {
            self.save_set(&set).await?;
        }
        Ok(())
    }

    async fn save_set(&self, set: &TestSet) -> Result<()> {
        let raw = serde_json::to_string(set)?;
        self.kv.set(&set_key(&set.id), &raw).await?;
        self.kv.sadd(TEST_SETS_SET, &set.id).await?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────

    pub async fn list_runs(&self) -> Result<Vec<TestRun>> {
        let mut ids = self.kv.smembers(TEST_RUNS_SET).await?;
        ids.sort();
        let mut runs = Vec::new();
        for id in ids {
            if let Ok(run) = self.get_run(&id).await {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    pub async fn get_run(&self, id: &str) -> Result<TestRun> {
        let raw = self
            .kv
            .get(&run_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("test run {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    /// Create a run with every case pending and kick the worker.
    pub async fn start_run(
        &self,
        state: &AppState,
        test_set_id: &str,
        compare_with_base_model: bool,
    ) -> Result<TestRun> {
        let set = self.get_set(test_set_id).await?;
        if set.tests.is_empty() {
            return Err(Error::InvalidRequest("test set has no cases".into()));
        }
        let mut run = TestRun {
            id: uuid::Uuid::new_v4().to_string(),
            test_set_id: test_set_id.to_owned(),
            status: TestRunStatus::Running,
            results: set
                .tests
                .iter()
                .map(|case| CaseResult {
                    id: case.id.clone(),
                    prompt: case.prompt.clone(),
                    status: CaseStatus::Pending,
                    signal_zero_response: None,
                    baseline_response: None,
                    missing_activations: None,
                    evaluation: None,
                })
                .collect(),
            summary: Default::default(),
            compare_with_base_model,
            started_at: Utc::now(),
            finished_at: None,
        };
        run.refresh_summary();
        self.save_run(&run).await?;
        self.kv.sadd(TEST_RUNS_SET, &run.id).await?;

        spawn_worker(state.clone(), run.id.clone());
        Ok(run)
    }

    /// Ask the worker to stop after the in-flight case.
    pub async fn stop_run(&self, id: &str) -> Result<TestRun> {
        self.update_run(id, |run| {
            if run.status == TestRunStatus::Running {
                run.status = TestRunStatus::Stopped;
            }
            Ok(())
        })
        .await
    }

    /// Resume a stopped run from its pending cases.
    pub async fn resume_run(&self, state: &AppState, id: &str) -> Result<TestRun> {
        let run = self
            .update_run(id, |run| {
                if run.status != TestRunStatus::Stopped {
                    return Err(Error::Conflict(format!("run {} is not stopped", run.id)));
                }
                run.status = TestRunStatus::Running;
                run.finished_at = None;
                Ok(())
            })
            .await?;
        spawn_worker(state.clone(), id.to_owned());
        Ok(run)
    }

    /// Reset one case to pending and re-run it.
    pub async fn rerun_case(&self, state: &AppState, run_id: &str, case_id: &str) -> Result<TestRun> {
        let run = self
            .update_run(run_id, |run| {
                let case = run
                    .results
                    .iter_mut()
                    .find(|c| c.id == case_id)
                    .ok_or_else(|| Error::NotFound(format!("case {case_id}")))?;
                case.status = CaseStatus::Pending;
                case.signal_zero_response = None;
                case.baseline_response = None;
                case.missing_activations = None;
                case.evaluation = None;
                run.status = TestRunStatus::Running;
                run.finished_at = None;
                run.refresh_summary();
                Ok(())
            })
            .await?;
        spawn_worker(state.clone(), run_id.to_owned());
        Ok(run)
    }

    pub(crate) async fn save_run(&self, run: &TestRun) -> Result<()> {
        let raw = serde_json::to_string(run)?;
        self.kv.set(&run_key(&run.id), &raw).await
    }

    pub(crate) async fn update_run(
        &self,
        id: &str,
        mut f: impl FnMut(&mut TestRun) -> Result<()>,
    ) -> Result<TestRun> {
        for _ in 0..UPDATE_RETRIES {
            let expected = self
                .kv
                .get(&run_key(id))
                .await?
                .ok_or_else(|| Error::NotFound(format!("test run {id}")))?;
            let mut run: TestRun = serde_json::from_str(&expected)?;
            f(&mut run)?;
            let new = serde_json::to_string(&run)?;
            if self
                .kv
                .compare_and_swap(&run_key(id), Some(&expected), Some(&new))
                .await?
            {
                return Ok(run);
            }
        }
        Err(Error::Unavailable(format!(
            "test run update for {id} kept losing the write race"
        )))
    }
}

fn spawn_worker(state: AppState, run_id: String) {
    let span = tracing::info_span!("test_run", run_id = %run_id);
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            if let Err(e) = run_pending_cases(&state, &run_id).await {
                tracing::warn!(error = %e, "test run worker failed");
                let _ = state
                    .tests
                    .update_run(&run_id, |run| {
                        run.status = TestRunStatus::Failed;
                        run.finished_at = Some(Utc::now());
                        Ok(())
                    })
                    .await;
            }
        },
        span,
    ));
}

/// Process pending cases in order until none remain or a stop lands.
async fn run_pending_cases(state: &AppState, run_id: &str) -> Result<()> {
    let expected_by_case: std::collections::HashMap<String, Vec<String>> = {
        let run = state.tests.get_run(run_id).await?;
        let set = state.tests.get_set(&run.test_set_id).await?;
        set.tests
            .into_iter()
            .map(|t| (t.id, t.expected_activations))
            .collect()
    };

    loop {
        let run = state.tests.get_run(run_id).await?;
        if run.status != TestRunStatus::Running {
            return Ok(());
        }
        let Some(case) = run
            .results
            .iter()
            .find(|c| c.status == CaseStatus::Pending)
            .cloned()
        else {
            state
                .tests
                .update_run(run_id, |run| {
                    if run.status == TestRunStatus::Running {
                        run.status = TestRunStatus::Completed;
                        run.finished_at = Some(Utc::now());
                    }
                    Ok(())
                })
                .await?;
            return Ok(());
        };

        mark_case(state, run_id, &case.id, |c| c.status = CaseStatus::Running).await?;
        let expected = expected_by_case
            .get(&case.id)
            .cloned()
            .unwrap_or_default();
        let outcome = run_case(state, &case, &expected, run.compare_with_base_model).await;

        match outcome {
            Ok(result) => {
                state
                    .tests
                    .update_run(run_id, |run| {
                        if let Some(slot) = run.results.iter_mut().find(|c| c.id == case.id) {
                            *slot = result.clone();
                        }
                        run.refresh_summary();
                        Ok(())
                    })
                    .await?;
            }
            Err(e) => {
                tracing::warn!(case_id = %case.id, error = %e, "test case errored");
                mark_case(state, run_id, &case.id, |c| {
                    c.status = CaseStatus::Failed;
                    c.signal_zero_response = Some(format!("[error] {e}"));
                })
                .await?;
            }
        }
    }
}

async fn mark_case(
    state: &AppState,
    run_id: &str,
    case_id: &str,
    f: impl Fn(&mut CaseResult),
) -> Result<()> {
    state
        .tests
        .update_run(run_id, |run| {
            if let Some(case) = run.results.iter_mut().find(|c| c.id == case_id) {
                f(case);
            }
            run.refresh_summary();
            Ok(())
        })
        .await?;
    Ok(())
}

/// One case: a full chat turn in a throwaway session, judged against the
/// expected activations.
async fn run_case(
    state: &AppState,
    case: &CaseResult,
    expected: &[String],
    compare: bool,
) -> Result<CaseResult> {
    let internal = AuthContext::internal();
    let session = state
        .contexts
        .create_session(SessionType::Conversation, json!({ "test": true }), None)
        .await?;
    let started_at = Utc::now();
    let message_id = format!("test-{}-{}", case.id, started_at.timestamp_millis());

    state
        .contexts
        .set_active_message(&session.id, &message_id, &internal)
        .await?;
    turn::process_message(
        state.clone(),
        TurnRequest {
            session_id: session.id.clone(),
            message_id: message_id.clone(),
            message: case.prompt.clone(),
            auth: internal.clone(),
            record_user: true,
        },
    )
    .await;

    let history = state.contexts.get_history(&session.id, &internal).await?;
    let response = history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::Model && t.correlation_id == message_id)
        .map(|t| t.content.clone())
        .unwrap_or_default();

    // Which expected symbols did the traces activate?
    let traces = state.traces.for_session(&session.id, Some(started_at)).await?;
    let activated: std::collections::HashSet<&str> = traces
        .iter()
        .flat_map(|t| t.activated_symbols())
        .collect();
    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !activated.contains(id.as_str()))
        .cloned()
        .collect();

    let mut result = case.clone();
    result.signal_zero_response = Some(response.clone());
    result.missing_activations = Some(missing.clone());
    result.status = if missing.is_empty() {
        CaseStatus::Passed
    } else {
        CaseStatus::Failed
    };

    if compare {
        match turn::run_baseline_test(state, &case.prompt).await {
            Ok(baseline) => {
                match turn::evaluate_comparison(state, &response, &baseline).await {
                    Ok(evaluation) => result.evaluation = Some(evaluation),
                    Err(e) => tracing::warn!(error = %e, "comparison evaluation failed"),
                }
                result.baseline_response = Some(baseline);
            }
            Err(e) => tracing::warn!(error = %e, "baseline run failed"),
        }
    }

    Ok(result)
}
