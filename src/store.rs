//! Persistent node observations.
//!
//! One row per observation identity. `created_at` is written only when the
//! identity has no row at the moment the upsert statement runs; `updated_at` is
//! refreshed on every write. Both live in a single `INSERT .. ON CONFLICT DO
//! UPDATE`, so SQLite resolves concurrent writers and no creation time is lost.

use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Which columns form the identity of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKeyShape {
    /// Identity is the node address; `state` is overwritten on each observation
    Address,
    /// Identity is `(address, state)`; each state keeps its own first-seen time
    #[default]
    AddressAndState,
}

impl NodeKeyShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKeyShape::Address => "address",
            NodeKeyShape::AddressAndState => "address_state",
        }
    }

    fn schema(&self) -> &'static str {
        match self {
            NodeKeyShape::Address => {
                r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    ip          TEXT NOT NULL PRIMARY KEY,
                    state       TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );
                "#
            }
            NodeKeyShape::AddressAndState => {
                r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    ip          TEXT NOT NULL,
                    state       TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL,
                    PRIMARY KEY (ip, state)
                );
                "#
            }
        }
    }

    fn key_columns(&self) -> &'static [&'static str] {
        match self {
            NodeKeyShape::Address => &["ip"],
            NodeKeyShape::AddressAndState => &["ip", "state"],
        }
    }

    fn upsert_sql(&self) -> &'static str {
        match self {
            NodeKeyShape::Address => {
                "INSERT INTO nodes (ip, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(ip) DO UPDATE SET state=excluded.state, updated_at=excluded.updated_at
                 RETURNING created_at"
            }
            NodeKeyShape::AddressAndState => {
                "INSERT INTO nodes (ip, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(ip, state) DO UPDATE SET updated_at=excluded.updated_at
                 RETURNING created_at"
            }
        }
    }
}

impl FromStr for NodeKeyShape {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" | "ip" => Ok(NodeKeyShape::Address),
            "address_state" | "ip_state" => Ok(NodeKeyShape::AddressAndState),
            other => Err(crate::error::ConfigError::NodeKeyShape(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObservation {
    pub ip: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether an upsert created the identity's row or refreshed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created,
    Updated,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// SQLite-backed store shared by all requests.
///
/// A single connection sits behind a mutex; writes run on the blocking pool.
#[derive(Clone)]
pub struct NodeStore {
    conn: Arc<Mutex<Connection>>,
    shape: NodeKeyShape,
    clock: Clock,
}

impl NodeStore {
    pub fn open<P: AsRef<Path>>(path: P, shape: NodeKeyShape) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(StoreError::Schema)?;
        let store = Self::init(conn, shape)?;
        info!(path = %path.display(), shape = shape.as_str(), "node store ready");
        Ok(store)
    }

    pub fn open_in_memory(shape: NodeKeyShape) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::init(conn, shape)
    }

    fn init(conn: Connection, shape: NodeKeyShape) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StoreError::Schema)?;
        conn.execute_batch(shape.schema())
            .map_err(StoreError::Schema)?;
        check_schema(&conn, shape)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            shape,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the time source. The clock is read while the write lock is held.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Record that `ip` was observed in `state` now
    pub fn upsert_blocking(&self, ip: &str, state: &str) -> Result<Upserted, StoreError> {
        let conn = self.lock()?;
        let now = format_ts((self.clock)());

        let mut stmt = conn
            .prepare_cached(self.shape.upsert_sql())
            .map_err(StoreError::Prepare)?;
        let created_at: String = stmt
            .query_row(params![ip, state, now], |row| row.get(0))
            .map_err(StoreError::Exec)?;

        let outcome = if created_at == now {
            Upserted::Created
        } else {
            Upserted::Updated
        };
        debug!(ip, state, ?outcome, "node state upserted");
        Ok(outcome)
    }

    /// Async wrapper that keeps SQLite I/O off the request workers
    pub async fn upsert(&self, ip: &str, state: &str) -> Result<Upserted, StoreError> {
        let store = self.clone();
        let ip = ip.to_string();
        let state = state.to_string();
        tokio::task::spawn_blocking(move || store.upsert_blocking(&ip, &state))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    pub fn get(&self, ip: &str, state: &str) -> Result<Option<NodeObservation>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT ip, state, created_at, updated_at FROM nodes WHERE ip = ?1 AND state = ?2",
            )
            .map_err(StoreError::Prepare)?;
        stmt.query_row(params![ip, state], read_row)
            .optional()
            .map_err(StoreError::Exec)
    }

    /// All rows for `ip`, oldest update first
    pub fn observations(&self, ip: &str) -> Result<Vec<NodeObservation>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT ip, state, created_at, updated_at FROM nodes WHERE ip = ?1 ORDER BY updated_at",
            )
            .map_err(StoreError::Prepare)?;
        let rows = stmt
            .query_map(params![ip], read_row)
            .map_err(StoreError::Exec)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::Exec)
    }
}

#[cfg(test)]
impl NodeStore {
    pub(crate) fn drop_table_for_tests(&self) {
        let conn = self.lock().expect("store lock");
        conn.execute_batch("DROP TABLE nodes;").expect("drop nodes");
    }
}

const NODE_COLUMNS: [&str; 4] = ["ip", "state", "created_at", "updated_at"];

/// Reject a pre-existing `nodes` table whose columns or primary key differ from
/// what `shape` writes.
fn check_schema(conn: &Connection, shape: NodeKeyShape) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare("SELECT name, pk FROM pragma_table_info('nodes')")
        .map_err(StoreError::Schema)?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(StoreError::Schema)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Schema)?;

    let missing: Vec<&str> = NODE_COLUMNS
        .into_iter()
        .filter(|want| !columns.iter().any(|(name, _)| name == want))
        .collect();
    if !missing.is_empty() {
        return Err(StoreError::SchemaMismatch {
            shape: shape.as_str(),
            detail: format!("missing column(s) {}", missing.join(", ")),
        });
    }

    let mut key: Vec<(i64, &str)> = columns
        .iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, pk)| (*pk, name.as_str()))
        .collect();
    key.sort_unstable();
    let key: Vec<&str> = key.into_iter().map(|(_, name)| name).collect();
    if key != shape.key_columns() {
        return Err(StoreError::SchemaMismatch {
            shape: shape.as_str(),
            detail: format!("primary key is ({})", key.join(", ")),
        });
    }
    Ok(())
}

// Fixed-width UTC text so lexical order equals chronological order
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeObservation> {
    let created: String = row.get(2)?;
    let updated: String = row.get(3)?;
    Ok(NodeObservation {
        ip: row.get(0)?,
        state: row.get(1)?,
        created_at: parse_ts(2, &created)?,
        updated_at: parse_ts(3, &updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn ticking_clock() -> Clock {
        let tick = Arc::new(AtomicI64::new(0));
        Arc::new(move || {
            let n = tick.fetch_add(1, Ordering::SeqCst);
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(n)
        })
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_first_observation_creates_row() {
        let store = NodeStore::open_in_memory(NodeKeyShape::AddressAndState)
            .unwrap()
            .with_clock(ticking_clock());

        assert_eq!(store.upsert_blocking("10.0.0.1", "up").unwrap(), Upserted::Created);

        let row = store.get("10.0.0.1", "up").unwrap().unwrap();
        assert_eq!(row.created_at, row.updated_at);
        assert_eq!(row.created_at, t(0));
    }

    #[test]
    fn test_repeat_observation_keeps_created_at() {
        let store = NodeStore::open_in_memory(NodeKeyShape::AddressAndState)
            .unwrap()
            .with_clock(ticking_clock());

        for _ in 0..5 {
            store.upsert_blocking("10.0.0.1", "up").unwrap();
        }
        assert_eq!(store.upsert_blocking("10.0.0.1", "up").unwrap(), Upserted::Updated);

        let rows = store.observations("10.0.0.1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, t(0));
        assert_eq!(rows[0].updated_at, t(5));
    }

    #[test]
    fn test_state_is_part_of_identity() {
        let store = NodeStore::open_in_memory(NodeKeyShape::AddressAndState)
            .unwrap()
            .with_clock(ticking_clock());

        store.upsert_blocking("10.0.0.1", "up").unwrap();
        store.upsert_blocking("10.0.0.1", "down").unwrap();
        store.upsert_blocking("10.0.0.1", "up").unwrap();

        let rows = store.observations("10.0.0.1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, "down");
        assert_eq!(rows[1].state, "up");
        assert_eq!(rows[1].created_at, t(0));
        assert_eq!(rows[1].updated_at, t(2));
    }

    #[test]
    fn test_address_shape_overwrites_state() {
        let store = NodeStore::open_in_memory(NodeKeyShape::Address)
            .unwrap()
            .with_clock(ticking_clock());

        assert_eq!(store.upsert_blocking("10.0.0.1", "up").unwrap(), Upserted::Created);
        assert_eq!(store.upsert_blocking("10.0.0.1", "down").unwrap(), Upserted::Updated);

        let rows = store.observations("10.0.0.1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "down");
        assert_eq!(rows[0].created_at, t(0));
        assert_eq!(rows[0].updated_at, t(1));
    }

    #[test]
    fn test_key_shape_from_str() {
        assert_eq!("address".parse::<NodeKeyShape>().unwrap(), NodeKeyShape::Address);
        assert_eq!(
            "ADDRESS_STATE".parse::<NodeKeyShape>().unwrap(),
            NodeKeyShape::AddressAndState
        );
        assert!("state".parse::<NodeKeyShape>().is_err());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = format_ts(t(9));
        let late = format_ts(t(10));
        assert!(early < late);
        assert_eq!(early.len(), late.len());
    }
}
