//! Traces — structured records of a symbolic reasoning chain, logged by
//! the model through the `log_trace` tool and read by the test runner.

use serde::{Deserialize, Serialize};

/// One hop in an activation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationStep {
    pub symbol_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub link_type: String,
}

/// The context a trace was triggered from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceContext {
    #[serde(default)]
    pub symbol_domain: String,
    #[serde(default)]
    pub trigger_vector: String,
}

/// A structured log of a symbolic reasoning chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub entry_node: String,
    #[serde(default)]
    pub activated_by: String,
    #[serde(default)]
    pub activation_path: Vec<ActivationStep>,
    #[serde(default)]
    pub source_context: SourceContext,
    #[serde(default)]
    pub output_node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
}

impl Trace {
    /// Every symbol id this trace touched: entry, path hops, output.
    pub fn activated_symbols(&self) -> Vec<&str> {
        let mut ids = Vec::with_capacity(self.activation_path.len() + 2);
        if !self.entry_node.is_empty() {
            ids.push(self.entry_node.as_str());
        }
        ids.extend(self.activation_path.iter().map(|s| s.symbol_id.as_str()));
        if !self.output_node.is_empty() {
            ids.push(self.output_node.as_str());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activated_symbols_covers_entry_path_output() {
        let trace = Trace {
            id: "t1".into(),
            session_id: Some("s1".into()),
            entry_node: "a".into(),
            activated_by: "prompt".into(),
            activation_path: vec![ActivationStep {
                symbol_id: "b".into(),
                reason: "linked".into(),
                link_type: "pattern".into(),
            }],
            source_context: SourceContext::default(),
            output_node: "c".into(),
            status: "complete".into(),
            created_at: String::new(),
        };
        assert_eq!(trace.activated_symbols(), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_nodes_are_skipped() {
        let trace = Trace {
            id: "t1".into(),
            session_id: None,
            entry_node: String::new(),
            activated_by: String::new(),
            activation_path: vec![],
            source_context: SourceContext::default(),
            output_node: String::new(),
            status: String::new(),
            created_at: String::new(),
        };
        assert!(trace.activated_symbols().is_empty());
    }
}
