//! Agent definitions and orchestration for troupe.
//!
//! This crate provides:
//! - `ConversationAgent`, the history-owning building block every other
//!   agent is made of
//! - The `DialogueAgent` and `TaskOrientedAgent` tools the coordinator
//!   delegates to
//! - `CoordinateRolePlayAgent` and the top-level `Orchestrator` entry point

mod blocks;
mod conversation;
mod coordinator;
mod dialogue;
mod events;
mod orchestrator;
mod plan;
pub mod prompts;
mod task_oriented;

pub use conversation::{ConversationAgent, MAX_HISTORY_LENGTH, MAX_TOOLS, MAX_TOOL_ROUNDS};
pub use coordinator::CoordinateRolePlayAgent;
pub use dialogue::{DialogueAgent, MAX_ITERATIONS, TASK_DONE};
pub use events::{EventBus, OrchestratorEvent};
pub use orchestrator::{Orchestrator, TaskOutcome};
pub use plan::{extract_balanced_json, parse_subtasks, SubTask};
pub use task_oriented::{TaskOrientedAgent, MAX_ATTEMPTS, MAX_SUBTASKS};
