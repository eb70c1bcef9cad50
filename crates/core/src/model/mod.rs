pub mod node;
pub mod tree;

pub use node::TimerNode;
pub use tree::{ROOT_ID, TimerTree};

use thiserror::Error;

/// Stable identifier of a timer node. Ids double as indices into the
/// tree's node arena, so a node's identity never changes after creation.
pub type NodeId = usize;

/// Misuse of the timer surface, reported to the immediate caller as a
/// failed operation. Instrumentation bugs must never unwind or otherwise
/// destabilize the host application, so none of these panic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimerError {
    #[error("timer '{label}' is already running")]
    AlreadyRunning { label: String },
    #[error("timer '{label}' is not running")]
    NotRunning { label: String },
    #[error("stop targets id {got} but the active timer is id {expected}")]
    StopMismatch { expected: NodeId, got: NodeId },
    #[error("stop targets '{got}' but the active timer is '{expected}'")]
    LabelMismatch { expected: String, got: String },
    #[error("stop called with no started timer to match it")]
    StopAtRoot,
    #[error("timer '{label}' is not a child of the active timer")]
    NotAChild { label: String },
    #[error("no timer with id {0}")]
    UnknownId(NodeId),
    #[error("timer '{label}' resolved to id {local} here but id {agreed} on the team leader")]
    TreeShapeDiverged {
        label: String,
        agreed: NodeId,
        local: NodeId,
    },
}
