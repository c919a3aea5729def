//! Name resolution, validation and guarded execution of tool calls.
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use super::{DispatchError, ToolCall, ToolContext, ToolDescriptor, ToolExecutionError, ToolKind, ToolOutput};

/// Entry point from the orchestration loop (and the MCP surface) into the
/// fixed tool registry.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<ToolContext>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(ctx: ToolContext, timeout: Duration) -> Self {
        Self {
            ctx: Arc::new(ctx),
            timeout,
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        super::descriptors()
    }

    /// Resolve a tool name and validate its raw arguments.
    ///
    /// No handler runs here.
    pub fn resolve(&self, name: &str, raw_args: &Value) -> Result<ToolCall, DispatchError> {
        let kind =
            ToolKind::from_name(name).ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;
        Ok(ToolCall::parse(kind, raw_args)?)
    }

    /// Run an already validated call under the per-tool timeout.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, ToolExecutionError> {
        let tool = call.kind().name();
        match tokio::time::timeout(self.timeout, self.ctx.run(call)).await {
            Ok(Ok(output)) => {
                info!(tool, hits = output.results.len(), "tool finished");
                Ok(output)
            }
            Ok(Err(e)) => {
                warn!(tool, "tool failed: {e}");
                Err(e)
            }
            Err(_) => {
                warn!(tool, timeout = ?self.timeout, "tool timed out");
                Err(ToolExecutionError::TimedOut(self.timeout))
            }
        }
    }

    /// Resolve, validate and execute in one go.
    pub async fn dispatch(&self, name: &str, raw_args: &Value) -> Result<ToolOutput, DispatchError> {
        let call = self.resolve(name, raw_args)?;
        Ok(self.execute(&call).await?)
    }
}
