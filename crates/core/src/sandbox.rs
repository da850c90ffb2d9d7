//! Sandboxed evaluation of user-authored tool bodies.
//!
//! A stored tool is a script written by the user. It is never evaluated in
//! the host process: an evaluator receives the body and the parsed arguments
//! and returns one value or a structured error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::ToolError;

/// Everything an evaluator needs to run one stored tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptInvocation {
    /// Tool name, for error reporting
    pub tool_name: String,

    /// Program and leading arguments (e.g. `["python3", "-"]`)
    pub interpreter: Vec<String>,

    /// Script source
    pub body: String,

    /// Parsed call arguments, bound into the script's scope
    pub arguments: serde_json::Value,

    /// Wall-clock limit
    pub timeout: Duration,
}

/// A capability-scoped evaluator for stored tool bodies.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Run the body and return its single result value.
    async fn evaluate(&self, invocation: ScriptInvocation) -> std::result::Result<serde_json::Value, ToolError>;
}
