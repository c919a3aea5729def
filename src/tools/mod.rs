//! Fixed registry of retrieval tools offered to the language model.
//!
//! Tools form a closed set known at compile time. Every variant carries a
//! typed argument struct; raw model arguments are deserialised and checked
//! before any handler runs.
pub mod dispatch;
pub mod handlers;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::retrieval::{RetrievalError, Retrieved};

pub use dispatch::Dispatcher;
pub use handlers::ToolContext;

const MAX_QUERY_CHARS: usize = 500;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InterestRateArgs {
    /// Number of most recent rate rows to return (1-50, default 50)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
    /// What to look for, phrased in natural language (Swedish preferred)
    pub query: String,
    /// Max results (1-20, default depends on the source)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BrokerArgs {
    /// County (län) or locality (ort) to find brokers in, e.g. "Stockholm"
    pub location: String,
}

impl InterestRateArgs {
    fn check(&self) -> Result<(), String> {
        match self.limit {
            Some(l) if !(1..=50).contains(&l) => Err("limit must be between 1 and 50".into()),
            _ => Ok(()),
        }
    }
}

impl SearchArgs {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: None,
        }
    }

    fn check(&self) -> Result<(), String> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err("query must not be empty".into());
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(format!("query must be at most {MAX_QUERY_CHARS} characters"));
        }
        match self.limit {
            Some(l) if !(1..=20).contains(&l) => Err("limit must be between 1 and 20".into()),
            _ => Ok(()),
        }
    }
}

impl BrokerArgs {
    fn check(&self) -> Result<(), String> {
        let location = self.location.trim();
        if location.is_empty() {
            return Err("location must not be empty".into());
        }
        if location.chars().count() > 100 {
            return Err("location must be at most 100 characters".into());
        }
        Ok(())
    }
}

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ToolKind {
    #[serde(rename = "get_interest_rates")]
    InterestRates,
    #[serde(rename = "search_traffic_situations")]
    TrafficSituations,
    #[serde(rename = "search_school_units")]
    SchoolUnits,
    #[serde(rename = "search_land_registry")]
    LandRegistry,
    #[serde(rename = "search_statistics")]
    Statistics,
    #[serde(rename = "find_brokers")]
    Brokers,
    #[serde(rename = "search_platform_faq")]
    PlatformFaq,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        Self::InterestRates,
        Self::TrafficSituations,
        Self::SchoolUnits,
        Self::LandRegistry,
        Self::Statistics,
        Self::Brokers,
        Self::PlatformFaq,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::InterestRates => "get_interest_rates",
            Self::TrafficSituations => "search_traffic_situations",
            Self::SchoolUnits => "search_school_units",
            Self::LandRegistry => "search_land_registry",
            Self::Statistics => "search_statistics",
            Self::Brokers => "find_brokers",
            Self::PlatformFaq => "search_platform_faq",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Store namespace the tool reads from.
    pub fn domain(self) -> &'static str {
        match self {
            Self::InterestRates => "interest_rates",
            Self::TrafficSituations => "traffic_situations",
            Self::SchoolUnits => "school_units",
            Self::LandRegistry => "land_registry_categories",
            Self::Statistics => "statistics",
            Self::Brokers => "brokers",
            Self::PlatformFaq => "platform_faq",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::InterestRates => {
                "Latest published interest rates (STIBOR, Riksbank policy rate, mortgage list rates), newest first. Use for any question about current or recent rates."
            }
            Self::TrafficSituations => {
                "Current traffic situations, roadworks and disruptions near a place or road."
            }
            Self::SchoolUnits => {
                "Preschools, primary and secondary school units: names, municipality, school type and profile."
            }
            Self::LandRegistry => {
                "Land registry (fastighetsregister) topics such as easements, mortgage deeds and title registration, with the registered entries of each matching topic."
            }
            Self::Statistics => {
                "Housing and population statistics: prices per square metre, sales volumes, demographics per area."
            }
            Self::Brokers => {
                "Real-estate brokers registered on the platform, matched on county (län) or locality (ort). Returns at most five brokers."
            }
            Self::PlatformFaq => {
                "Frequently asked questions about using the marketplace: listings, accounts, subscriptions, the broker portal."
            }
        }
    }

    pub fn input_schema(self) -> Value {
        match self {
            Self::InterestRates => schema_of::<InterestRateArgs>(),
            Self::Brokers => schema_of::<BrokerArgs>(),
            _ => schema_of::<SearchArgs>(),
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

/// What the model sees of a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    ToolKind::ALL.into_iter().map(ToolKind::descriptor).collect()
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut schema =
        serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

// ── Validated calls ──────────────────────────────────────────────────

/// A tool call whose arguments passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    InterestRates(InterestRateArgs),
    TrafficSituations(SearchArgs),
    SchoolUnits(SearchArgs),
    LandRegistry(SearchArgs),
    Statistics(SearchArgs),
    Brokers(BrokerArgs),
    PlatformFaq(SearchArgs),
}

impl ToolCall {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::InterestRates(_) => ToolKind::InterestRates,
            Self::TrafficSituations(_) => ToolKind::TrafficSituations,
            Self::SchoolUnits(_) => ToolKind::SchoolUnits,
            Self::LandRegistry(_) => ToolKind::LandRegistry,
            Self::Statistics(_) => ToolKind::Statistics,
            Self::Brokers(_) => ToolKind::Brokers,
            Self::PlatformFaq(_) => ToolKind::PlatformFaq,
        }
    }

    /// Deserialise and check raw arguments for `kind`.
    ///
    /// A missing or `null` argument object counts as `{}`.
    pub fn parse(kind: ToolKind, raw: &Value) -> Result<Self, SchemaValidationError> {
        let raw = if raw.is_null() { json!({}) } else { raw.clone() };
        let invalid = |message: String| SchemaValidationError {
            tool: kind.name(),
            message,
        };
        if !raw.is_object() {
            return Err(invalid("arguments must be a JSON object".into()));
        }

        fn de<T: serde::de::DeserializeOwned>(raw: Value) -> Result<T, String> {
            serde_json::from_value(raw).map_err(|e| e.to_string())
        }

        let call = match kind {
            ToolKind::InterestRates => {
                let args: InterestRateArgs = de(raw).map_err(invalid)?;
                args.check().map_err(invalid)?;
                Self::InterestRates(args)
            }
            ToolKind::Brokers => {
                let args: BrokerArgs = de(raw).map_err(invalid)?;
                args.check().map_err(invalid)?;
                Self::Brokers(args)
            }
            search => {
                let args: SearchArgs = de(raw).map_err(invalid)?;
                args.check().map_err(invalid)?;
                match search {
                    ToolKind::TrafficSituations => Self::TrafficSituations(args),
                    ToolKind::SchoolUnits => Self::SchoolUnits(args),
                    ToolKind::LandRegistry => Self::LandRegistry(args),
                    ToolKind::Statistics => Self::Statistics(args),
                    _ => Self::PlatformFaq(args),
                }
            }
        };
        Ok(call)
    }

    /// The validated arguments as JSON.
    pub fn arguments(&self) -> Value {
        let value = match self {
            Self::InterestRates(a) => serde_json::to_value(a),
            Self::Brokers(a) => serde_json::to_value(a),
            Self::TrafficSituations(a)
            | Self::SchoolUnits(a)
            | Self::LandRegistry(a)
            | Self::Statistics(a)
            | Self::PlatformFaq(a) => serde_json::to_value(a),
        };
        value.unwrap_or(Value::Null)
    }
}

// ── Results and errors ───────────────────────────────────────────────

/// Successful tool result handed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub results: Vec<Value>,
}

impl ToolOutput {
    /// Whether the tool found anything the answer can be grounded in.
    pub fn has_evidence(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({ "results": self.results })
    }
}

impl From<Retrieved> for ToolOutput {
    fn from(r: Retrieved) -> Self {
        Self {
            results: r.into_items(),
        }
    }
}

/// Model-supplied arguments did not satisfy the tool's input schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid arguments for {tool}: {message}")]
pub struct SchemaValidationError {
    pub tool: &'static str,
    pub message: String,
}

/// A handler failed while running.
#[derive(Error, Debug)]
pub enum ToolExecutionError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("tool timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("tool handler crashed")]
    Crashed,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    InvalidArguments(#[from] SchemaValidationError),

    #[error(transparent)]
    Execution(#[from] ToolExecutionError),
}

impl DispatchError {
    /// Structured tool-result payload the model can react to.
    pub fn payload(&self) -> Value {
        match self {
            Self::UnknownTool(name) => json!({
                "error": self.to_string(),
                "available_tools": ToolKind::ALL.map(ToolKind::name),
                "requested": name,
            }),
            Self::InvalidArguments(e) => json!({
                "error": self.to_string(),
                "expected_schema": ToolKind::from_name(e.tool).map(ToolKind::input_schema),
            }),
            Self::Execution(_) => json!({ "error": self.to_string() }),
        }
    }
}
