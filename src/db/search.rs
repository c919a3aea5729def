use super::records::{RECORD_COLUMNS, domain_dimensions, map_record};
use super::{Store, StoreError, models::*, serialize_vector};
use rusqlite::params;

impl Store {
    /// Cosine nearest-neighbour search within one domain.
    ///
    /// Only records with similarity strictly above `threshold` qualify.
    /// Results are ordered by descending similarity; equal scores keep
    /// insertion order so repeated queries return identical lists.
    pub fn search(
        &self,
        domain: &str,
        query_vector: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;

        match domain_dimensions(&conn, domain)? {
            None => return Ok(Vec::new()),
            Some(expected) if expected != query_vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    domain: domain.to_string(),
                    expected,
                    actual: query_vector.len(),
                });
            }
            Some(_) => {}
        }

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {RECORD_COLUMNS}, similarity FROM (
                SELECT {RECORD_COLUMNS},
                       1.0 - vec_distance_cosine(embedding, ?1) AS similarity
                FROM records
                WHERE domain = ?2 AND embedding IS NOT NULL
            )
            WHERE similarity > ?3
            ORDER BY similarity DESC, id ASC
            LIMIT ?4
            "#
        ))?;

        let rows = stmt.query_map(
            params![
                serialize_vector(query_vector),
                domain,
                threshold,
                limit as i64
            ],
            |row| {
                Ok(RetrievalResult {
                    record: map_record(row)?,
                    similarity: row.get(6)?,
                })
            },
        )?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Two-level search: match categories by similarity, then attach up to
    /// `children_per_category` child records referencing each category.
    ///
    /// Children are fetched by exact reference; they are not compared with
    /// the query vector.
    pub fn search_hierarchical(
        &self,
        category_domain: &str,
        child_domain: &str,
        query_vector: &[f32],
        threshold: f64,
        category_limit: usize,
        children_per_category: usize,
    ) -> Result<Vec<CategoryMatch>, StoreError> {
        let categories = self.search(category_domain, query_vector, threshold, category_limit)?;

        categories
            .into_iter()
            .map(|category| {
                let entries = self.fetch_children(
                    child_domain,
                    &category.record.external_id,
                    children_per_category,
                )?;
                Ok(CategoryMatch { category, entries })
            })
            .collect()
    }
}
