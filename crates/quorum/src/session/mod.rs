//! Session orchestration: the single entry point callers use to bind a
//! user to a live protocol session and exchange streamed messages.

pub mod models;
pub mod orchestrator;

pub use models::{ExecutionSession, SessionInfo};
pub use orchestrator::{
    MessageStream, SHELL_ESCAPE_PREFIX, SessionConfig, SessionOrchestrator,
};
