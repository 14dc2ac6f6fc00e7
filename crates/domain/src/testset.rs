//! Test sets and test runs — prompts evaluated against expected symbol
//! activations, optionally compared to a baseline model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub prompt: String,
    /// Symbol ids the run must activate (observed via traces) to pass.
    #[serde(default)]
    pub expected_activations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestRunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

/// Judge scores from the comparison rubric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f32,
    pub depth: f32,
    pub coherence: f32,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub id: String,
    pub prompt: String,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_zero_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_activations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub test_set_id: String,
    pub status: TestRunStatus,
    #[serde(default)]
    pub results: Vec<CaseResult>,
    #[serde(default)]
    pub summary: RunSummary,
    #[serde(default)]
    pub compare_with_base_model: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestRun {
    /// Recompute the summary from the result rows.
    pub fn refresh_summary(&mut self) {
        self.summary = RunSummary {
            total: self.results.len(),
            completed: self
                .results
                .iter()
                .filter(|r| matches!(r.status, CaseStatus::Passed | CaseStatus::Failed))
                .count(),
            passed: self
                .results
                .iter()
                .filter(|r| r.status == CaseStatus::Passed)
                .count(),
            failed: self
                .results
                .iter()
                .filter(|r| r.status == CaseStatus::Failed)
                .count(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_terminal_states_only() {
        let mut run = TestRun {
            id: "r1".into(),
            test_set_id: "ts1".into(),
            status: TestRunStatus::Running,
            results: vec![
                CaseResult {
                    id: "c1".into(),
                    prompt: "p".into(),
                    status: CaseStatus::Passed,
                    signal_zero_response: None,
                    baseline_response: None,
                    missing_activations: None,
                    evaluation: None,
                },
                CaseResult {
                    id: "c2".into(),
                    prompt: "p".into(),
                    status: CaseStatus::Failed,
                    signal_zero_response: None,
                    baseline_response: None,
                    missing_activations: None,
                    evaluation: None,
                },
                CaseResult {
                    id: "c3".into(),
                    prompt: "p".into(),
                    status: CaseStatus::Pending,
                    signal_zero_response: None,
                    baseline_response: None,
                    missing_activations: None,
                    evaluation: None,
                },
            ],
            summary: RunSummary::default(),
            compare_with_base_model: false,
            started_at: Utc::now(),
            finished_at: None,
        };
        run.refresh_summary();
        assert_eq!(run.summary.total, 3);
        assert_eq!(run.summary.completed, 2);
        assert_eq!(run.summary.passed, 1);
        assert_eq!(run.summary.failed, 1);
    }
}
