//! Stored tools: user-authored scripts run in a subprocess.
//!
//! The body is piped to the configured interpreter on stdin and the parsed
//! arguments arrive as JSON in the `TOOL_ARGS` environment variable. The
//! child gets a cleared environment (only `PATH` survives), its own working
//! directory, and one wall-clock limit covering both the write of the body
//! and the run. Whatever it prints on stdout is the tool's return value:
//! JSON when it parses, a string otherwise.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use toolpilot_config::StoredToolConfig;
use toolpilot_core::error::ToolError;
use toolpilot_core::{ScriptEvaluator, ScriptInvocation, ToolDefinition};
use tracing::{debug, warn};

/// A stored tool ready to be offered and invoked.
#[derive(Debug, Clone)]
pub struct StoredTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub interpreter: Vec<String>,
    pub body: String,
    pub timeout: Duration,
}

impl StoredTool {
    pub fn from_config(config: &StoredToolConfig) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone(),
            parameters: config.parameters.clone(),
            interpreter: config.interpreter.clone(),
            body: config.body.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Bind parsed arguments into an invocation for an evaluator.
    pub fn invocation(&self, arguments: serde_json::Value) -> ScriptInvocation {
        ScriptInvocation {
            tool_name: self.name.clone(),
            interpreter: self.interpreter.clone(),
            body: self.body.clone(),
            arguments,
            timeout: self.timeout,
        }
    }
}

/// Runs stored tool bodies as child processes.
pub struct SubprocessEvaluator {
    working_dir: PathBuf,
}

impl SubprocessEvaluator {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

impl Default for SubprocessEvaluator {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[async_trait]
impl ScriptEvaluator for SubprocessEvaluator {
    async fn evaluate(&self, invocation: ScriptInvocation) -> Result<serde_json::Value, ToolError> {
        let tool_name = invocation.tool_name.clone();
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: tool_name.clone(),
            reason,
        };

        let (program, leading_args) = invocation
            .interpreter
            .split_first()
            .ok_or_else(|| failed("no interpreter configured".into()))?;
        let arguments = serde_json::to_string(&invocation.arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        debug!(tool = %tool_name, interpreter = %program, "Evaluating stored tool");

        let mut command = Command::new(program);
        command
            .args(leading_args)
            .env_clear()
            .env("TOOL_ARGS", &arguments)
            .env("TOOL_NAME", &tool_name)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let mut child = command
            .spawn()
            .map_err(|e| failed(format!("failed to start '{program}': {e}")))?;

        // Feed the body while collecting output; one deadline covers both.
        let stdin = child.stdin.take();
        let body = invocation.body.into_bytes();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&body).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::time::timeout(invocation.timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| ToolError::Timeout {
            tool_name: tool_name.clone(),
            timeout_secs: invocation.timeout.as_secs(),
        })?;

        match fed {
            // The interpreter never read its stdin; the exit status decides.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(tool = %tool_name, "Stored tool closed stdin early");
            }
            Err(e) => return Err(failed(format!("failed to send script: {e}"))),
            Ok(()) => {}
        }
        let output = output.map_err(|e| failed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(tool = %tool_name, exit_code = code, "Stored tool failed");
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(failed(format!("exit code {code}: {detail}")));
        }

        Ok(serde_json::from_str(&stdout).unwrap_or(serde_json::Value::String(stdout)))
    }
}
