//! apiweaver: natural-language-to-API orchestration engine.
//!
//! Given a user utterance and a project id, the engine ranks the project's
//! registered endpoints, asks an LLM for a multi-step execution plan, runs
//! the plan against the target HTTP service with credential forwarding and
//! cross-step data references, short-circuits once the intent is
//! satisfied, and heals its endpoint metadata when execution reveals gaps.
//!
//! Transport shells (HTTP, WebSocket, CLI) and OpenAPI ingestion live
//! outside this crate; they marshal in and out of [`types`].

pub mod catalog;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod heal;
pub mod judge;
pub mod jsonpath;
pub mod llm;
pub mod plan;
pub mod planner;
pub mod resolver;
pub mod types;

mod orchestrator;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult};
pub use orchestrator::{Orchestrator, PassthroughFormatter, ResponseFormatter};
pub use types::{AuthBlob, ChatRequest, ChatResponse, ChatStreamUpdate, UpdateKind};
