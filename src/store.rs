//! The fragment store module
//! Provide upsert, dirty check and nearest neighbour queries over one SQLite file

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::distance::{LastFailure, StatsSnapshot, VecDist};
use crate::error::{Error, Result};
use crate::vector::{decode, encode};

/// Label used when the caller does not pick one.
pub const DEFAULT_LABEL: &str = "default";

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS fragments
(
    id INTEGER PRIMARY KEY,

    label TEXT NOT NULL DEFAULT 'default',

    name TEXT NOT NULL,
    content TEXT NOT NULL,

    embedding_model TEXT NOT NULL,
    embedding_vector BLOB NOT NULL,

    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),

    CONSTRAINT unique_label_name UNIQUE (label, name)
);
";

const FRAGMENT_COLUMNS: &str =
    "id, label, name, content, embedding_model, embedding_vector, created_at, updated_at";

/// A stored piece of text and the embedding that represents it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: i64,
    pub label: String,
    pub name: String,
    pub content: String,
    pub embedding_model: String,
    pub embedding_vector: Vec<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A fragment row as SQLite hands it back, vector still encoded.
struct FragmentRow {
    id: i64,
    label: String,
    name: String,
    content: String,
    embedding_model: String,
    embedding_vector: Vec<u8>,
    created_at: i64,
    updated_at: i64,
}

impl FragmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            name: row.get(2)?,
            content: row.get(3)?,
            embedding_model: row.get(4)?,
            embedding_vector: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    /// A blob whose length is not a multiple of 8 fails here rather than
    /// being skipped.
    fn into_fragment(self) -> Result<Fragment> {
        Ok(Fragment {
            id: self.id,
            label: self.label,
            name: self.name,
            content: self.content,
            embedding_model: self.embedding_model,
            embedding_vector: decode(&self.embedding_vector)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Persistent store of fragments backed by a single SQLite file.
pub struct FragmentStore {
    conn: Connection,
    distance: VecDist,
    failure: LastFailure,
}

impl FragmentStore {
    /// Opens or creates the store at `path` with a fresh distance function.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fragdb::FragmentStore;
    ///
    /// let store = FragmentStore::open("fragdb.db").unwrap();
    /// println!("{} fragments", store.count().unwrap());
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, VecDist::default())
    }

    /// Opens or creates the store at `path`, sharing `distance`'s decode cache
    /// and counters with every other store built from it.
    pub fn open_with(path: impl AsRef<Path>, distance: VecDist) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Self::with_distance(Connection::open(path)?, distance)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_distance(Connection::open_in_memory()?, VecDist::default())
    }

    /// Applies the schema to `conn` and registers `vec_dist` on it.
    pub fn with_distance(conn: Connection, distance: VecDist) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        let failure = distance.register(&conn)?;
        Ok(Self {
            conn,
            distance,
            failure,
        })
    }

    pub fn distance(&self) -> &VecDist {
        &self.distance
    }

    pub fn distance_stats(&self) -> StatsSnapshot {
        self.distance.stats().snapshot()
    }

    /// Inserts a fragment, or updates the one already stored under
    /// `(label, name)`.
    ///
    /// An update replaces `content`, `embedding_model`, `embedding_vector` and
    /// `updated_at`; `id` and `created_at` are kept.
    ///
    /// # Examples
    ///
    /// ```
    /// use fragdb::FragmentStore;
    ///
    /// let store = FragmentStore::open_in_memory().unwrap();
    /// let first = store.upsert("QA", "a.txt", "hello", "openai/small", &[1.0, 0.0]).unwrap();
    /// let second = store.upsert("QA", "a.txt", "hello!", "openai/small", &[0.0, 1.0]).unwrap();
    ///
    /// assert_eq!(first.id, second.id);
    /// assert_eq!(second.content, "hello!");
    /// assert_eq!(store.count().unwrap(), 1);
    /// ```
    pub fn upsert(
        &self,
        label: &str,
        name: &str,
        content: &str,
        model: &str,
        vector: &[f64],
    ) -> Result<Fragment> {
        let sql = format!(
            "INSERT INTO fragments (label, name, content, embedding_model, embedding_vector)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (label, name) DO UPDATE SET
                content = excluded.content,
                embedding_model = excluded.embedding_model,
                embedding_vector = excluded.embedding_vector,
                updated_at = CAST(strftime('%s', 'now') AS INTEGER)
             RETURNING {FRAGMENT_COLUMNS}"
        );

        let row = self.conn.query_row(
            &sql,
            params![label, name, content, model, encode(vector)],
            FragmentRow::from_row,
        )?;

        row.into_fragment()
    }

    /// True when no fragment holds exactly this `(label, name, content)`,
    /// meaning the content has to be embedded (again).
    pub fn is_dirty(&self, label: &str, name: &str, content: &str) -> Result<bool> {
        let dirty = self.conn.query_row(
            "SELECT COUNT(*) = 0
             FROM fragments
             WHERE label = ?1 AND name = ?2 AND content = ?3",
            params![label, name, content],
            |row| row.get::<_, bool>(0),
        )?;

        Ok(dirty)
    }

    /// The `limit` fragments closest to `vector` among those whose label
    /// matches the SQL `LIKE` pattern `label_pattern` (`"%"` for all).
    ///
    /// Every matching row is scored by `vec_dist`; ties are broken by id. Any
    /// row that cannot be scored fails the whole query.
    ///
    /// # Examples
    ///
    /// ```
    /// use fragdb::FragmentStore;
    ///
    /// let store = FragmentStore::open_in_memory().unwrap();
    /// store.upsert("QA", "x", "x", "m/e", &[1.0, 0.0]).unwrap();
    /// store.upsert("QA", "y", "y", "m/e", &[0.0, 1.0]).unwrap();
    ///
    /// let hits = store.nearest(&[0.9, 0.1], "QA", 1).unwrap();
    /// assert_eq!(hits[0].name, "x");
    /// ```
    pub fn nearest(&self, vector: &[f64], label_pattern: &str, limit: usize) -> Result<Vec<Fragment>> {
        let sql = format!(
            "SELECT {FRAGMENT_COLUMNS}
             FROM fragments
             WHERE label LIKE ?1
             ORDER BY vec_dist(?2, embedding_vector), id
             LIMIT ?3"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // drop anything left over from an earlier statement
        self.failure.take();
        let rows = self
            .collect_rows(&sql, params![label_pattern, encode(vector), limit])
            .map_err(|err| self.query_error(err))?;

        rows.into_iter().map(FragmentRow::into_fragment).collect()
    }

    pub fn get(&self, id: i64) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], FragmentRow::from_row)
            .optional()?;

        row.map(FragmentRow::into_fragment).transpose()
    }

    /// All fragments, ordered by id.
    pub fn list(&self) -> Result<Vec<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments ORDER BY id");
        let rows = self.collect_rows(&sql, [])?;

        rows.into_iter().map(FragmentRow::into_fragment).collect()
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;

        usize::try_from(count)
            .map_err(|_| Error::Persistence(rusqlite::Error::IntegralValueOutOfRange(0, count)))
    }

    fn collect_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> rusqlite::Result<Vec<FragmentRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, FragmentRow::from_row)?;
        rows.collect()
    }

    /// SQLite only carries the message of a failed `vec_dist`; prefer the
    /// typed failure it recorded.
    fn query_error(&self, err: rusqlite::Error) -> Error {
        match self.failure.take() {
            Some(failure) => failure.into(),
            None => Error::Persistence(err),
        }
    }
}

#[cfg(test)]
mod store_test {
    use super::*;
    use crate::error::CodecError;

    const MODEL: &str = "openai/text-embedding-3-small";

    fn scenario_store() -> FragmentStore {
        let store = FragmentStore::open_in_memory().unwrap();
        store.upsert("QA", "qa-1", "first answer", MODEL, &[1.0, 0.0, 0.0]).unwrap();
        store.upsert("QA", "qa-2", "second answer", MODEL, &[0.0, 1.0, 0.0]).unwrap();
        store.upsert("policies", "pol-1", "a policy", MODEL, &[0.9, 0.1, 0.0]).unwrap();
        store
    }

    // ========== Upsert Tests ==========

    #[test]
    fn test_upsert_returns_stored_row() {
        let store = FragmentStore::open_in_memory().unwrap();
        let frag = store.upsert("L", "N", "hello", MODEL, &[0.5, -0.25, 8.0]).unwrap();

        assert!(frag.id > 0);
        assert_eq!(frag.label, "L");
        assert_eq!(frag.name, "N");
        assert_eq!(frag.content, "hello");
        assert_eq!(frag.embedding_model, MODEL);
        assert_eq!(frag.embedding_vector, vec![0.5, -0.25, 8.0]);
        assert!(frag.created_at > 0);
        assert_eq!(frag.created_at, frag.updated_at);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = FragmentStore::open_in_memory().unwrap();
        let first = store.upsert("L", "N", "hello", MODEL, &[1.0, 2.0]).unwrap();
        let second = store.upsert("L", "N", "hello", MODEL, &[1.0, 2.0]).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.embedding_vector, second.embedding_vector);
    }

    #[test]
    fn test_upsert_conflict_updates_in_place() {
        let store = FragmentStore::open_in_memory().unwrap();
        let first = store.upsert("L", "N", "hello", MODEL, &[1.0, 2.0]).unwrap();
        let second = store.upsert("L", "N", "goodbye", "voyageai/voyage-3", &[3.0, 4.0]).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.content, "goodbye");
        assert_eq!(second.embedding_model, "voyageai/voyage-3");
        assert_eq!(second.embedding_vector, vec![3.0, 4.0]);
    }

    #[test]
    fn test_same_name_under_other_label_is_new_row() {
        let store = FragmentStore::open_in_memory().unwrap();
        let a = store.upsert("QA", "N", "x", MODEL, &[1.0]).unwrap();
        let b = store.upsert(DEFAULT_LABEL, "N", "x", MODEL, &[1.0]).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_upsert_preserves_special_values() {
        let store = FragmentStore::open_in_memory().unwrap();
        let vector = vec![-0.0, f64::INFINITY, f64::NEG_INFINITY, 5e-324];
        let frag = store.upsert("L", "N", "c", MODEL, &vector).unwrap();

        let stored = store.get(frag.id).unwrap().unwrap();
        let bits: Vec<u64> = stored.embedding_vector.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u64> = vector.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    // ========== Dirty Check Tests ==========

    #[test]
    fn test_is_dirty() {
        let store = FragmentStore::open_in_memory().unwrap();
        assert!(store.is_dirty("L", "N", "hello").unwrap());

        store.upsert("L", "N", "hello", MODEL, &[1.0]).unwrap();
        assert!(!store.is_dirty("L", "N", "hello").unwrap());
        assert!(store.is_dirty("L", "N", "goodbye").unwrap());
        assert!(store.is_dirty("L", "N", "hello ").unwrap());
        assert!(store.is_dirty("other", "N", "hello").unwrap());
        assert!(store.is_dirty("L", "M", "hello").unwrap());
    }

    // ========== Nearest Tests ==========

    #[test]
    fn test_nearest_within_label() {
        let store = scenario_store();
        let query = [1.0, 0.2, 0.0];

        let hits = store.nearest(&query, "QA", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "qa-1");
    }

    #[test]
    fn test_nearest_all_labels_ordered() {
        let store = scenario_store();
        let query = [1.0, 0.2, 0.0];

        let hits = store.nearest(&query, "%", 10).unwrap();
        let names: Vec<&str> = hits.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["pol-1", "qa-1", "qa-2"]);
    }

    #[test]
    fn test_nearest_uses_like_patterns() {
        let store = scenario_store();
        let query = [0.0, 1.0, 0.0];

        assert_eq!(store.nearest(&query, "Q%", 10).unwrap().len(), 2);
        assert_eq!(store.nearest(&query, "pol_cies", 10).unwrap().len(), 1);
        // SQLite LIKE ignores ASCII case
        assert_eq!(store.nearest(&query, "qa", 10).unwrap().len(), 2);
        assert!(store.nearest(&query, "missing", 10).unwrap().is_empty());
        assert!(store.nearest(&query, "%", 0).unwrap().is_empty());
    }

    #[test]
    fn test_nearest_ties_break_by_id() {
        let store = FragmentStore::open_in_memory().unwrap();
        let a = store.upsert("L", "a", "a", MODEL, &[2.0, 0.0]).unwrap();
        let b = store.upsert("L", "b", "b", MODEL, &[1.0, 0.0]).unwrap();

        let hits = store.nearest(&[1.0, 0.0], "L", 2).unwrap();
        assert_eq!(hits[0].id, a.id);
        assert_eq!(hits[1].id, b.id);
    }

    #[test]
    fn test_nearest_ranks_large_magnitudes() {
        let store = FragmentStore::open_in_memory().unwrap();
        let far = store.upsert("L", "far", "far", MODEL, &[1e100, -1e100]).unwrap();
        let near = store.upsert("L", "near", "near", MODEL, &[1e100, 1e100]).unwrap();

        let hits = store.nearest(&[1e100, 1e100], "L", 2).unwrap();
        assert_eq!(hits[0].id, near.id);
        assert_eq!(hits[1].id, far.id);
    }

    #[test]
    fn test_nearest_dimension_mismatch_fails() {
        let store = scenario_store();
        let result = store.nearest(&[1.0, 0.0], "%", 10);
        assert!(matches!(result, Err(Error::LengthMismatch { left: 2, right: 3 })));
    }

    #[test]
    fn test_nearest_corrupt_blob_fails_query() {
        let store = scenario_store();
        store
            .conn
            .execute(
                "INSERT INTO fragments (label, name, content, embedding_model, embedding_vector)
                 VALUES ('QA', 'broken', 'x', ?1, ?2)",
                params![MODEL, vec![0u8; 9]],
            )
            .unwrap();

        let result = store.nearest(&[1.0, 0.0, 0.0], "QA", 10);
        assert!(matches!(result, Err(Error::Codec(CodecError::InvalidLength(9)))));

        // other partitions are unaffected
        assert_eq!(store.nearest(&[1.0, 0.0, 0.0], "policies", 10).unwrap().len(), 1);
        assert!(store.list().is_err());
    }

    #[test]
    fn test_nearest_counts_one_call_per_row() {
        let store = scenario_store();
        store.nearest(&[1.0, 0.0, 0.0], "QA", 1).unwrap();
        assert_eq!(store.distance_stats().calls, 2);
    }

    // ========== Read Tests ==========

    #[test]
    fn test_get_list_count() {
        let store = scenario_store();
        assert_eq!(store.count().unwrap(), 3);

        let all = store.list().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let first = store.get(all[0].id).unwrap().unwrap();
        assert_eq!(first, all[0]);
        assert!(store.get(9999).unwrap().is_none());
    }

    #[test]
    fn test_stores_share_injected_cache() {
        let distance = VecDist::default();
        let first = FragmentStore::with_distance(Connection::open_in_memory().unwrap(), distance.clone()).unwrap();
        let second = FragmentStore::with_distance(Connection::open_in_memory().unwrap(), distance.clone()).unwrap();

        first.upsert("L", "a", "a", MODEL, &[1.0, 0.0]).unwrap();
        second.upsert("L", "a", "a", MODEL, &[1.0, 0.0]).unwrap();
        first.nearest(&[0.0, 1.0], "%", 1).unwrap();
        second.nearest(&[0.0, 1.0], "%", 1).unwrap();

        // one query blob and one stored blob, seen by both stores
        assert_eq!(distance.cache().len(), 2);
        assert_eq!(distance.stats().snapshot().calls, 2);
    }
}
