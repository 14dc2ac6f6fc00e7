//! The runtime: turn execution, tool dispatch, traces, the agent
//! scheduler, the test runner and startup recovery.

pub mod agents;
pub mod cron;
pub mod recovery;
pub mod testrun;
pub mod tools;
pub mod traces;
pub mod turn;

use crate::state::AppState;

impl AppState {
    /// Start draining a session's queue in the background (no-op when
    /// the session is busy or the queue is empty).
    pub fn kick_queue(&self, session_id: String) {
        let state = self.clone();
        tokio::spawn(async move {
            turn::drain_queue(state, session_id).await;
        });
    }
}
