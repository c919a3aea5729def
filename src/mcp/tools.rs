/// MCP tool handlers.
///
/// Exposes the same seven retrieval tools the chat loop offers its model,
/// so an external MCP client can query the marketplace data directly:
/// 1. get_interest_rates        – latest rates, newest first
/// 2. search_traffic_situations – traffic disruptions
/// 3. search_school_units       – school units
/// 4. search_land_registry      – land registry topics with their entries
/// 5. search_statistics         – housing and population statistics
/// 6. find_brokers              – brokers by county or locality
/// 7. search_platform_faq       – marketplace FAQ
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use serde::Serialize;

use crate::tools::{BrokerArgs, Dispatcher, InterestRateArgs, SearchArgs, ToolKind};

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

fn error_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(value.to_string())]))
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct MarketTools {
    dispatcher: Dispatcher,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for MarketTools {}

#[tool_router]
impl MarketTools {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    /// Validation and execution go through the dispatcher so MCP callers get
    /// the same checks and structured errors as the chat model.
    async fn call(&self, kind: ToolKind, args: impl Serialize) -> Result<CallToolResult, McpError> {
        let raw = serde_json::to_value(args)
            .map_err(|e| McpError::internal_error(format!("encoding arguments failed: {e}"), None))?;
        match self.dispatcher.dispatch(kind.name(), &raw).await {
            Ok(output) => json_result(output.to_json()),
            Err(e) => error_result(e.payload()),
        }
    }

    #[tool(
        description = "Latest published interest rates (STIBOR, Riksbank policy rate, mortgage list rates), newest first."
    )]
    async fn get_interest_rates(
        &self,
        params: Parameters<InterestRateArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::InterestRates, params.0).await
    }

    #[tool(description = "Current traffic situations, roadworks and disruptions near a place or road.")]
    async fn search_traffic_situations(
        &self,
        params: Parameters<SearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::TrafficSituations, params.0).await
    }

    #[tool(description = "Preschools, primary and secondary school units by name, municipality or profile.")]
    async fn search_school_units(
        &self,
        params: Parameters<SearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::SchoolUnits, params.0).await
    }

    #[tool(
        description = "Land registry topics (easements, mortgage deeds, title registration) with the registered entries of each matching topic."
    )]
    async fn search_land_registry(
        &self,
        params: Parameters<SearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::LandRegistry, params.0).await
    }

    #[tool(description = "Housing and population statistics per area.")]
    async fn search_statistics(
        &self,
        params: Parameters<SearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::Statistics, params.0).await
    }

    #[tool(description = "Real-estate brokers matched on county (län) or locality (ort). At most five.")]
    async fn find_brokers(&self, params: Parameters<BrokerArgs>) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::Brokers, params.0).await
    }

    #[tool(description = "Frequently asked questions about using the marketplace.")]
    async fn search_platform_faq(
        &self,
        params: Parameters<SearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(ToolKind::PlatformFaq, params.0).await
    }
}
