//! Tiered exact/partial string-match ranking used by the broker directory.
//!
//! | match                         | score |
//! |-------------------------------|-------|
//! | exact primary (county)        | 3     |
//! | exact secondary (locality)    | 2     |
//! | partial primary               | 1     |
//! | partial secondary             | 0     |
//! | none                          | excluded |
//!
//! Comparison is case-insensitive on trimmed values; "partial" means the
//! field contains the needle.

use serde::Serialize;
use serde_json::Value;

use crate::db::models::Record;

#[derive(Debug, Clone, Serialize)]
pub struct RankedRecord {
    #[serde(flatten)]
    pub record: Record,
    pub score: u8,
}

fn field(payload: &Value, name: &str) -> Option<String> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
}

/// Score one payload against `needle`; `None` means no match at all.
pub fn score(payload: &Value, primary: &str, secondary: &str, needle: &str) -> Option<u8> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let primary = field(payload, primary);
    let secondary = field(payload, secondary);

    let exact = |f: &Option<String>| f.as_deref() == Some(needle.as_str());
    let partial = |f: &Option<String>| f.as_deref().is_some_and(|v| v.contains(&needle));

    if exact(&primary) {
        Some(3)
    } else if exact(&secondary) {
        Some(2)
    } else if partial(&primary) {
        Some(1)
    } else if partial(&secondary) {
        Some(0)
    } else {
        None
    }
}

/// Rank `records` by descending score and keep the top `limit`.
///
/// Equal scores keep the input order.
pub fn rank(
    records: Vec<Record>,
    primary: &str,
    secondary: &str,
    needle: &str,
    limit: usize,
) -> Vec<RankedRecord> {
    let mut ranked: Vec<RankedRecord> = records
        .into_iter()
        .filter_map(|record| {
            score(&record.payload, primary, secondary, needle)
                .map(|score| RankedRecord { record, score })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(id: i64, county: &str, locality: &str) -> Record {
        Record {
            id,
            domain: "brokers".into(),
            external_id: format!("b{id}"),
            parent_ref: None,
            recorded_at: None,
            payload: json!({"name": format!("Mäklare {id}"), "county": county, "locality": locality}),
        }
    }

    #[test]
    fn test_score_tiers() {
        let s = |c, l| score(&json!({"county": c, "locality": l}), "county", "locality", "Stockholm");
        assert_eq!(s("Stockholm", "Solna"), Some(3));
        assert_eq!(s("Uppsala", "stockholm"), Some(2));
        assert_eq!(s("Stockholms län", "Täby"), Some(1));
        assert_eq!(s("Uppsala", "Stockholmsvägen"), Some(0));
        assert_eq!(s("Skåne", "Malmö"), None);
    }

    #[test]
    fn test_score_missing_fields_and_blank_needle() {
        assert_eq!(score(&json!({}), "county", "locality", "Lund"), None);
        assert_eq!(score(&json!({"county": "Lund"}), "county", "locality", "  "), None);
    }

    #[test]
    fn test_score_non_ascii_case() {
        let p = json!({"county": "Örebro län", "locality": "ÖREBRO"});
        assert_eq!(score(&p, "county", "locality", "örebro"), Some(2));
    }

    #[test]
    fn test_rank_top_five_by_score() {
        let records = vec![
            broker(1, "Uppsala", "Stockholmsnäs"),
            broker(2, "Stockholms län", "Nacka"),
            broker(3, "Stockholm", "Solna"),
            broker(4, "Skåne", "Lund"),
            broker(5, "Västmanland", "Stockholm"),
            broker(6, "Stockholm", "Kista"),
            broker(7, "Stockholms län", "Lidingö"),
            broker(8, "Uppsala", "Stockholmsbacken"),
        ];
        let ranked = rank(records, "county", "locality", "Stockholm", 5);

        let got: Vec<(&str, u8)> = ranked
            .iter()
            .map(|r| (r.record.external_id.as_str(), r.score))
            .collect();
        assert_eq!(
            got,
            vec![("b3", 3), ("b6", 3), ("b5", 2), ("b2", 1), ("b7", 1)]
        );
    }

    #[test]
    fn test_ranked_serializes_score() {
        let ranked = rank(vec![broker(1, "Gotland", "Visby")], "county", "locality", "gotland", 5);
        let v = serde_json::to_value(&ranked[0]).unwrap();
        assert_eq!(v["score"], 3);
        assert_eq!(v["data"]["locality"], "Visby");
    }
}
