use super::{Store, StoreError, models::*, serialize_vector};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

pub(super) const RECORD_COLUMNS: &str =
    "id, domain, external_id, payload, parent_ref, recorded_at";

/// Map the leading `RECORD_COLUMNS` of a row into a [`Record`].
pub(super) fn map_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    let payload: String = row.get(3)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Record {
        id: row.get(0)?,
        domain: row.get(1)?,
        external_id: row.get(2)?,
        payload,
        parent_ref: row.get(4)?,
        recorded_at: row.get::<_, Option<DateTime<Utc>>>(5)?,
    })
}

pub(super) fn domain_dimensions(
    conn: &Connection,
    domain: &str,
) -> Result<Option<usize>, StoreError> {
    let dims: Option<i64> = conn
        .query_row(
            "SELECT dimensions FROM domains WHERE name = ?1",
            params![domain],
            |row| row.get(0),
        )
        .optional()?;
    Ok(dims.map(|d| d as usize))
}

fn upsert(
    conn: &Connection,
    domain: &str,
    record: &NewRecord,
    vector: Option<&[f32]>,
) -> Result<i64, StoreError> {
    if let Some(v) = vector {
        if v.is_empty() {
            return Err(StoreError::EmptyVector(domain.to_string()));
        }
        match domain_dimensions(conn, domain)? {
            Some(expected) if expected != v.len() => {
                return Err(StoreError::DimensionMismatch {
                    domain: domain.to_string(),
                    expected,
                    actual: v.len(),
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO domains (name, dimensions) VALUES (?1, ?2)",
                    params![domain, v.len() as i64],
                )?;
            }
        }
    }

    let payload = serde_json::to_string(&record.payload)?;
    let id = conn.query_row(
        r#"
        INSERT INTO records (domain, external_id, payload, parent_ref, recorded_at, embedding)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(domain, external_id) DO UPDATE SET
            payload = excluded.payload,
            parent_ref = excluded.parent_ref,
            recorded_at = excluded.recorded_at,
            embedding = excluded.embedding
        RETURNING id
        "#,
        params![
            domain,
            record.external_id,
            payload,
            record.parent_ref,
            record.recorded_at,
            vector.map(serialize_vector),
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

impl Store {
    /// Insert or replace a record (keyed by domain + external id).
    ///
    /// The first embedded insert into a domain fixes its dimensionality;
    /// later vectors of another length are rejected.
    pub fn insert(
        &self,
        domain: &str,
        record: &NewRecord,
        vector: Option<&[f32]>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let id = upsert(&tx, domain, record, vector)?;
        tx.commit()?;
        Ok(id)
    }

    /// Replace every record whose external id starts with `prefix` by
    /// `records`, in one transaction. Returns how many stale records were
    /// removed.
    pub fn replace_prefixed(
        &self,
        domain: &str,
        prefix: &str,
        records: &[(NewRecord, Vec<f32>)],
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM records WHERE domain = ?1 AND substr(external_id, 1, length(?2)) = ?2",
            params![domain, prefix],
        )?;
        for (record, vector) in records {
            upsert(&tx, domain, record, Some(vector))?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Most recent records of a time-series domain, newest first.
    ///
    /// Records without a timestamp sort last; equal timestamps fall back to
    /// the most recently inserted row.
    pub fn fetch_recent(&self, domain: &str, limit: usize) -> Result<Vec<Record>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE domain = ?1
             ORDER BY recorded_at IS NULL, recorded_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![domain, limit as i64], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Child records referencing `parent_ref`, in insertion order.
    pub fn fetch_children(
        &self,
        domain: &str,
        parent_ref: &str,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE domain = ?1 AND parent_ref = ?2
             ORDER BY id ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![domain, parent_ref, limit as i64], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every record of a domain, in insertion order.
    pub fn fetch_all(&self, domain: &str) -> Result<Vec<Record>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE domain = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![domain], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Vector dimensionality pinned for `domain`, if any vector was stored.
    pub fn dimensions(&self, domain: &str) -> Result<Option<usize>, StoreError> {
        let conn = self.pool.get()?;
        domain_dimensions(&conn, domain)
    }

    pub fn count(&self, domain: &str) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM records WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_and_fetch_all() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert("faq", &NewRecord::new("q1", json!({"q": "Hur annonserar jag?"})), Some(&[1.0, 0.0]))
            .unwrap();
        store
            .insert("faq", &NewRecord::new("q2", json!({"q": "Vad kostar det?"})), Some(&[0.0, 1.0]))
            .unwrap();

        let all = store.fetch_all("faq").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].external_id, "q1");
        assert_eq!(all[1].payload["q"], "Vad kostar det?");
        assert_eq!(store.dimensions("faq").unwrap(), Some(2));
    }

    #[test]
    fn test_upsert_keeps_identity() {
        let store = Store::open_in_memory().unwrap();
        let first = store.insert("faq", &NewRecord::new("q1", json!({"v": 1})), None).unwrap();
        let second = store.insert("faq", &NewRecord::new("q1", json!({"v": 2})), None).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count("faq").unwrap(), 1);
        assert_eq!(store.fetch_all("faq").unwrap()[0].payload["v"], 2);
    }

    #[test]
    fn test_replace_prefixed_drops_stale_records() {
        let store = Store::open_in_memory().unwrap();
        for id in ["guide.md#0", "guide.md#1", "guide.md#2", "guide.md.old#0"] {
            store.insert("faq", &NewRecord::new(id, json!({})), Some(&[1.0, 0.0])).unwrap();
        }

        let fresh = vec![(NewRecord::new("guide.md#0", json!({"v": 2})), vec![0.0, 1.0])];
        let removed = store.replace_prefixed("faq", "guide.md#", &fresh).unwrap();
        assert_eq!(removed, 3);

        let ids: Vec<String> = store.fetch_all("faq").unwrap().into_iter().map(|r| r.external_id).collect();
        assert_eq!(ids, vec!["guide.md.old#0", "guide.md#0"]);
    }

    #[test]
    fn test_replace_prefixed_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        store.insert("faq", &NewRecord::new("guide.md#0", json!({})), Some(&[1.0, 0.0])).unwrap();

        let wrong = vec![(NewRecord::new("guide.md#0", json!({})), vec![1.0, 0.0, 0.0])];
        assert!(store.replace_prefixed("faq", "guide.md#", &wrong).is_err());
        assert_eq!(store.count("faq").unwrap(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert("schools", &NewRecord::new("a", json!({})), Some(&[1.0, 0.0, 0.0]))
            .unwrap();
        let err = store
            .insert("schools", &NewRecord::new("b", json!({})), Some(&[1.0, 0.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 3, actual: 2, .. }
        ));

        // other domains pick their own dimensionality
        store
            .insert("traffic", &NewRecord::new("t", json!({})), Some(&[1.0, 0.0]))
            .unwrap();
        assert_eq!(store.dimensions("traffic").unwrap(), Some(2));
    }

    #[test]
    fn test_empty_vector_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .insert("faq", &NewRecord::new("a", json!({})), Some(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyVector(_)));
    }

    #[test]
    fn test_fetch_recent_orders_by_date_desc() {
        let store = Store::open_in_memory().unwrap();
        for (id, d) in [("r5", 5), ("r20", 20), ("r1", 1), ("r12", 12)] {
            store
                .insert(
                    "interest_rates",
                    &NewRecord::new(id, json!({"rate": d})).recorded_at(day(d)),
                    None,
                )
                .unwrap();
        }
        store
            .insert("interest_rates", &NewRecord::new("undated", json!({})), None)
            .unwrap();

        let recent = store.fetch_recent("interest_rates", 3).unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["r20", "r12", "r5"]);

        let all = store.fetch_recent("interest_rates", 50).unwrap();
        assert_eq!(all.last().unwrap().external_id, "undated");
    }

    #[test]
    fn test_fetch_children_by_exact_reference() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..15 {
            store
                .insert(
                    "entries",
                    &NewRecord::new(format!("e{i}"), json!({"n": i})).with_parent("cat-a"),
                    None,
                )
                .unwrap();
        }
        store
            .insert("entries", &NewRecord::new("x", json!({})).with_parent("cat-ab"), None)
            .unwrap();

        let children = store.fetch_children("entries", "cat-a", 10).unwrap();
        assert_eq!(children.len(), 10);
        assert_eq!(children[0].external_id, "e0");
        assert!(children.iter().all(|c| c.parent_ref.as_deref() == Some("cat-a")));
    }
}
