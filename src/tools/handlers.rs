//! Tool handlers: each validated call becomes one retrieval against the
//! tool's domain under that domain's configured relevance policy.
use tracing::debug;

use super::{ToolCall, ToolExecutionError, ToolOutput};
use crate::config::DomainsConfig;
use crate::retrieval::{RelevancePolicy, Retriever};

/// Everything a handler may read. Passed explicitly; handlers never reach
/// global state and never see the conversation.
#[derive(Clone)]
pub struct ToolContext {
    retriever: Retriever,
    domains: DomainsConfig,
}

impl ToolContext {
    pub fn new(retriever: Retriever, domains: DomainsConfig) -> Self {
        Self { retriever, domains }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn policy(&self, call: &ToolCall) -> &RelevancePolicy {
        let d = &self.domains;
        match call {
            ToolCall::InterestRates(_) => &d.interest_rates,
            ToolCall::TrafficSituations(_) => &d.traffic_situations,
            ToolCall::SchoolUnits(_) => &d.school_units,
            ToolCall::LandRegistry(_) => &d.land_registry_categories,
            ToolCall::Statistics(_) => &d.statistics,
            ToolCall::Brokers(_) => &d.brokers,
            ToolCall::PlatformFaq(_) => &d.platform_faq,
        }
    }

    pub async fn run(&self, call: &ToolCall) -> Result<ToolOutput, ToolExecutionError> {
        let (query, limit) = match call {
            ToolCall::InterestRates(a) => ("", a.limit),
            ToolCall::Brokers(a) => (a.location.trim(), None),
            ToolCall::TrafficSituations(a)
            | ToolCall::SchoolUnits(a)
            | ToolCall::LandRegistry(a)
            | ToolCall::Statistics(a)
            | ToolCall::PlatformFaq(a) => (a.query.trim(), a.limit),
        };
        let kind = call.kind();
        let policy = self.policy(call);
        debug!(tool = kind.name(), policy = policy.name(), "running tool");

        let retrieved = self
            .retriever
            .retrieve(kind.domain(), policy, query, limit.map(|l| l as usize))
            .await?;
        Ok(ToolOutput::from(retrieved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::db::models::NewRecord;
    use crate::embedder::EmbeddingGenerator;
    use crate::embedder::mock::MockEmbedder;
    use crate::tools::{BrokerArgs, InterestRateArgs, SearchArgs};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn context(embedder: MockEmbedder) -> ToolContext {
        let retriever = Retriever::new(
            Store::open_in_memory().unwrap(),
            EmbeddingGenerator::new(Arc::new(embedder), 500),
        );
        ToolContext::new(retriever, DomainsConfig::default())
    }

    #[tokio::test]
    async fn test_interest_rates_newest_first_capped() {
        let ctx = context(MockEmbedder::new(3));
        let store = ctx.retriever().store();
        for day in 1..=28 {
            for series in ["STIBOR 3M", "STIBOR 1M"] {
                let at = Utc.with_ymd_and_hms(2024, 2, day, 11, 0, 0).unwrap();
                store
                    .insert(
                        "interest_rates",
                        &NewRecord::new(format!("{series}-{day}"), json!({"series": series, "rate": 3.0 + f64::from(day) / 100.0}))
                            .recorded_at(at),
                        None,
                    )
                    .unwrap();
            }
        }

        let out = ctx
            .run(&ToolCall::InterestRates(InterestRateArgs::default()))
            .await
            .unwrap();
        assert_eq!(out.results.len(), 50);
        assert!(out.results[0]["id"].as_str().unwrap().ends_with("-28"));
        assert!(
            out.results[0]["recorded_at"].as_str().unwrap()
                >= out.results[49]["recorded_at"].as_str().unwrap()
        );

        let few = ctx
            .run(&ToolCall::InterestRates(InterestRateArgs { limit: Some(2) }))
            .await
            .unwrap();
        assert_eq!(few.results.len(), 2);
    }

    #[tokio::test]
    async fn test_brokers_use_tiered_policy() {
        let ctx = context(MockEmbedder::new(3));
        let store = ctx.retriever().store();
        for (id, county, locality) in [
            ("a", "Uppsala", "Knivsta"),
            ("b", "Stockholm", "Täby"),
            ("c", "Västra Götaland", "Göteborg"),
        ] {
            store
                .insert("brokers", &NewRecord::new(id, json!({"county": county, "locality": locality})), None)
                .unwrap();
        }
        let out = ctx
            .run(&ToolCall::Brokers(BrokerArgs {
                location: " stockholm ".into(),
            }))
            .await
            .unwrap();
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0]["id"], "b");
        assert_eq!(out.results[0]["score"], 3);
    }

    #[tokio::test]
    async fn test_land_registry_two_levels() {
        let ctx = context(MockEmbedder::new(2).with_vector("servitut väg", vec![1.0, 0.0]));
        let store = ctx.retriever().store();
        store
            .insert(
                "land_registry_categories",
                &NewRecord::new("servitut", json!({"name": "Servitut"})),
                Some(&[1.0, 0.0]),
            )
            .unwrap();
        store
            .insert(
                "land_registry_entries",
                &NewRecord::new("e1", json!({"text": "Vägservitut till förmån för X"})).with_parent("servitut"),
                None,
            )
            .unwrap();

        let out = ctx
            .run(&ToolCall::LandRegistry(SearchArgs::new("servitut väg")))
            .await
            .unwrap();
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0]["category"]["id"], "servitut");
        assert_eq!(out.results[0]["entries"][0]["id"], "e1");
    }

    #[tokio::test]
    async fn test_store_failure_is_execution_error() {
        let ctx = context(MockEmbedder::new(4));
        ctx.retriever()
            .store()
            .insert("statistics", &NewRecord::new("s", json!({})), Some(&[1.0, 0.0]))
            .unwrap();
        let err = ctx
            .run(&ToolCall::Statistics(SearchArgs::new("kvadratmeterpris")))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolExecutionError::Retrieval(_)));
    }
}
