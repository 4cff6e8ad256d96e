//! troupe-core: Core types and traits for troupe
//!
//! This crate provides the foundational types and traits used throughout
//! the troupe multi-agent orchestration engine.

pub mod error;
pub mod filter;
pub mod message;
pub mod provider;
pub mod record;
pub mod stream;
pub mod taskref;
pub mod tool;
pub mod usage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;
pub use filter::strip_dialogue_markup;
pub use message::{Message, Role, StreamChunk, ToolCall, Usage};
pub use provider::{
    CompletionRequest, ModelKind, ModelResolver, Provider, ProviderKind, ResolvedModel,
    StreamResult,
};
pub use record::{
    ContentBlock, ContentBlockKind, MessageRecord, MessageStatus, MessageStore, NewMessage,
    RecordSink, Studio, StudioAction, TaskRecord,
};
pub use stream::StreamingCompletion;
pub use taskref::{AgentTaskRef, TurnAggregator, TURN_ROLE_LABEL};
pub use tool::{PropertySchema, Tool, ToolDefinition, ToolParameters, ToolRegistry};
pub use usage::{UsageStats, UsageTracker};

pub type Result<T> = std::result::Result<T, Error>;
