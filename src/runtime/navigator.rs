/// Navigator: maps an execution result to the next step of the run
///
/// Pure transition table over `NodeStatus`, except for loop bookkeeping: loop statuses
/// open and close the node's loop scope in the run context store (the loop id is the
/// node key), and ERROR / VALIDATION_ERROR close every open loop so deferred cleanup
/// never leaks past a halted run.

use crate::context::RunContextStore;
use crate::runtime::executor::{ExecutionResult, NodeStatus, ValidationError};
use crate::workflow::types::Node;
use serde::Serialize;

/// Why a run stopped without completing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltReason {
    Retry { node: String },
    Waiting { node: String },
    ValidationFailed { node: String, errors: Vec<ValidationError> },
}

impl HaltReason {
    /// Suspended runs keep their context store for `resume`
    pub fn is_suspension(&self) -> bool {
        matches!(self, HaltReason::Retry { .. } | HaltReason::Waiting { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Continue with another node (or the same one, for loop iterations)
    Advance(String),
    /// Re-run the current node without touching loop state
    Stay,
    Complete,
    Halt(HaltReason),
    /// Fatal: the run aborts
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub transition: Transition,
    /// Context keys collected by loop ends while navigating
    pub collected: Vec<String>,
}

impl Navigation {
    fn to(transition: Transition) -> Self {
        Self {
            transition,
            collected: Vec::new(),
        }
    }
}

fn advance_or_complete(next: Option<&String>) -> Transition {
    match next {
        Some(key) => Transition::Advance(key.clone()),
        None => Transition::Complete,
    }
}

/// Apply the transition table for `result` produced by `node`
pub fn navigate(node: &Node, result: &ExecutionResult, store: &RunContextStore) -> Navigation {
    let explicit = result.next_node_key.as_ref();
    match result.status {
        NodeStatus::Success => Navigation::to(advance_or_complete(node.next.first())),
        NodeStatus::Next => Navigation::to(advance_or_complete(explicit)),
        NodeStatus::Error => {
            let collected = store.end_all_loops();
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "node returned ERROR".to_string());
            Navigation {
                transition: Transition::Fail(message),
                collected,
            }
        }
        NodeStatus::Retry => Navigation::to(Transition::Halt(HaltReason::Retry {
            node: node.key.clone(),
        })),
        NodeStatus::Waiting => Navigation::to(Transition::Halt(HaltReason::Waiting {
            node: node.key.clone(),
        })),
        NodeStatus::ValidationError => {
            let collected = store.end_all_loops();
            tracing::warn!("🚫 Node '{}' failed validation with {} errors", node.key, result.validation.len());
            Navigation {
                transition: Transition::Halt(HaltReason::ValidationFailed {
                    node: node.key.clone(),
                    errors: result.validation.clone(),
                }),
                collected,
            }
        }
        NodeStatus::LoopNext => {
            if !store.is_loop_active(&node.key) {
                store.start_loop(&node.key);
            }
            Navigation::to(advance_or_complete(explicit))
        }
        NodeStatus::LoopEnd | NodeStatus::LoopBreak => Navigation {
            collected: store.end_loop(&node.key),
            transition: advance_or_complete(explicit),
        },
        NodeStatus::LoopContinue => Navigation::to(Transition::Stay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::context::RefValueFactory;

    fn store() -> RunContextStore {
        RunContextStore::new("nav", RefValueFactory::new(ContextConfig::default()))
    }

    #[test]
    fn success_follows_first_declared_successor() {
        let node = Node::new("a", "t").then("b").then("c");
        let nav = navigate(&node, &ExecutionResult::success(None), &store());
        assert_eq!(nav.transition, Transition::Advance("b".into()));

        let leaf = Node::new("z", "t");
        let nav = navigate(&leaf, &ExecutionResult::success(None), &store());
        assert_eq!(nav.transition, Transition::Complete);
    }

    #[test]
    fn next_without_key_completes() {
        let node = Node::new("c", "t").then("ignored");
        let nav = navigate(&node, &ExecutionResult::goto(NodeStatus::Next, None), &store());
        assert_eq!(nav.transition, Transition::Complete);
    }

    #[test]
    fn loop_statuses_manage_the_node_scope() {
        let store = store();
        let node = Node::new("d", "t");
        let again = ExecutionResult::goto(NodeStatus::LoopNext, Some("d".into()));
        navigate(&node, &again, &store);
        navigate(&node, &again, &store);
        assert_eq!(store.active_loops(), vec!["d".to_string()]);

        let nav = navigate(&node, &ExecutionResult::new(NodeStatus::LoopContinue), &store);
        assert_eq!(nav.transition, Transition::Stay);
        assert!(store.is_loop_active("d"));

        let nav = navigate(&node, &ExecutionResult::goto(NodeStatus::LoopBreak, Some("e".into())), &store);
        assert_eq!(nav.transition, Transition::Advance("e".into()));
        assert!(store.active_loops().is_empty());
    }

    #[tokio::test]
    async fn error_closes_loops_and_applies_their_ledger() {
        let store = store();
        store.put("src.output", serde_json::json!({"item": 1})).await;
        store.register_consumer("src.output", "x");
        store.start_loop("outer");
        store.consume("x", "src.output");
        assert!(store.contains("src.output"));

        let nav = navigate(&Node::new("x", "t"), &ExecutionResult::error("boom"), &store);
        assert_eq!(nav.transition, Transition::Fail("boom".into()));
        assert_eq!(nav.collected, vec!["src.output".to_string()]);
        assert!(store.active_loops().is_empty());
        assert!(!store.contains("src.output"));
    }

    #[test]
    fn retry_and_waiting_suspend() {
        let store = store();
        let node = Node::new("w", "t");
        let nav = navigate(&node, &ExecutionResult::new(NodeStatus::Waiting), &store);
        let Transition::Halt(reason) = nav.transition else {
            panic!("expected a halt");
        };
        assert!(reason.is_suspension());
    }
}
