//! troupe-providers: model provider implementations for troupe
//!
//! This crate provides implementations of the Provider trait for hosted
//! OpenAI-compatible APIs and self-hosted servers, plus the resolver that
//! maps model kinds to configured provider/model pairings.

pub mod ollama;
pub mod openai;
pub mod policy;
pub mod resolver;

mod wire;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use policy::ToolSupportPolicy;
pub use resolver::{ConfiguredResolver, ModelChoice};
