/// MCP server setup using `rmcp` with stdio transport.
use crate::mcp::tools::MarketTools;
use crate::tools::Dispatcher;
use anyhow::{Context, Result};
use rmcp::{ServiceExt, handler::server::router::Router, transport::io::stdio};
use tracing::info;

/// MCP server serving the retrieval tools over stdio.
#[derive(Clone)]
pub struct McpServer {
    dispatcher: Dispatcher,
}

impl McpServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Serve on stdio until the client disconnects.
    pub async fn start(self) -> Result<()> {
        info!("Starting MCP server on stdio...");
        let (stdin, stdout) = stdio();

        let tools = MarketTools::new(self.dispatcher);
        let router = Router::new(tools.clone()).with_tools(tools.tool_router.clone());

        let service = router
            .serve((stdin, stdout))
            .await
            .context("MCP server failed to start on stdio")?;
        service
            .waiting()
            .await
            .context("MCP server encountered an error during stdio transport")?;

        Ok(())
    }
}
