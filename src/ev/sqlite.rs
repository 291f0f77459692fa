use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::core::error::Result;
use crate::core::traits::EvPersistence;
use crate::core::types::SignalKey;

use super::profile::EvProfile;

/// SQLite 持久化：ev_profiles 保存当前画像，ev_outcomes 为只追加的历史
pub struct SqliteEvPersistence {
    conn: Mutex<Connection>,
}

impl SqliteEvPersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // 风险预算存储共用同一文件
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS ev_profiles (
                namespace TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                mode TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                expected_value REAL NOT NULL,
                variance_estimate REAL NOT NULL,
                m2 REAL NOT NULL,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (namespace, strategy_id, instrument, mode)
            );
            CREATE TABLE IF NOT EXISTS ev_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                mode TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 某个键的历史结果条数（只追加表）
    pub fn outcome_count(&self, namespace: &str, key: &SignalKey) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ev_outcomes
             WHERE namespace = ?1 AND strategy_id = ?2 AND instrument = ?3 AND mode = ?4",
            params![namespace, key.strategy_id, key.instrument, key.mode],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<(String, EvProfile)> {
    let namespace: String = row.get(0)?;
    let trade_count: i64 = row.get(4)?;
    Ok((
        namespace,
        EvProfile {
            key: SignalKey::new(
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ),
            trade_count: trade_count as u64,
            expected_value: row.get(5)?,
            variance_estimate: row.get(6)?,
            m2: row.get(7)?,
            last_updated: row.get(8)?,
        },
    ))
}

const SELECT_COLUMNS: &str = "SELECT namespace, strategy_id, instrument, mode, trade_count,
    expected_value, variance_estimate, m2, last_updated FROM ev_profiles";

impl EvPersistence for SqliteEvPersistence {
    fn load(&self, namespace: &str, key: &SignalKey) -> Result<Option<EvProfile>> {
        let conn = self.conn.lock();
        let sql = format!(
            "{} WHERE namespace = ?1 AND strategy_id = ?2 AND instrument = ?3 AND mode = ?4",
            SELECT_COLUMNS
        );
        let found = conn
            .query_row(
                &sql,
                params![namespace, key.strategy_id, key.instrument, key.mode],
                row_to_profile,
            )
            .optional()?;
        Ok(found.map(|(_, profile)| profile))
    }

    fn load_all(&self) -> Result<Vec<(String, EvProfile)>> {
        let conn = self.conn.lock();
        let sql = format!(
            "{} ORDER BY namespace, strategy_id, instrument, mode",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_profile)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn persist(&self, namespace: &str, profile: &EvProfile, realized_pnl: f64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = &profile.key;
        // trade_count 单调不减：旧值更大时不覆盖
        tx.execute(
            "INSERT INTO ev_profiles (namespace, strategy_id, instrument, mode, trade_count,
                expected_value, variance_estimate, m2, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(namespace, strategy_id, instrument, mode) DO UPDATE SET
                trade_count = excluded.trade_count,
                expected_value = excluded.expected_value,
                variance_estimate = excluded.variance_estimate,
                m2 = excluded.m2,
                last_updated = excluded.last_updated
             WHERE excluded.trade_count >= ev_profiles.trade_count",
            params![
                namespace,
                key.strategy_id,
                key.instrument,
                key.mode,
                profile.trade_count as i64,
                profile.expected_value,
                profile.variance_estimate,
                profile.m2,
                profile.last_updated
            ],
        )?;
        tx.execute(
            "INSERT INTO ev_outcomes (namespace, strategy_id, instrument, mode, realized_pnl,
                trade_count, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                namespace,
                key.strategy_id,
                key.instrument,
                key.mode,
                realized_pnl,
                profile.trade_count as i64,
                profile.last_updated
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn insert_if_absent(&self, namespace: &str, profile: &EvProfile) -> Result<bool> {
        let conn = self.conn.lock();
        let key = &profile.key;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ev_profiles (namespace, strategy_id, instrument, mode,
                trade_count, expected_value, variance_estimate, m2, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                namespace,
                key.strategy_id,
                key.instrument,
                key.mode,
                profile.trade_count as i64,
                profile.expected_value,
                profile.variance_estimate,
                profile.m2,
                profile.last_updated
            ],
        )?;
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn key() -> SignalKey {
        SignalKey::new("s1", "BTCUSDT", "live")
    }

    #[test]
    fn test_persist_and_reload_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev/profiles.db");

        let p1 = EvProfile::cold(key()).with_outcome(3.0, Utc::now());
        let p2 = p1.with_outcome(1.0, Utc::now());
        {
            let store = SqliteEvPersistence::open(&path).unwrap();
            store.persist("ns", &p1, 3.0).unwrap();
            store.persist("ns", &p2, 1.0).unwrap();
            assert_eq!(store.outcome_count("ns", &key()).unwrap(), 2);
        }

        let reopened = SqliteEvPersistence::open(&path).unwrap();
        let loaded = reopened.load("ns", &key()).unwrap().unwrap();
        assert_eq!(loaded.trade_count, 2);
        assert_eq!(loaded.expected_value, 2.0);
        assert!((loaded.m2 - p2.m2).abs() < 1e-12);
        assert!(reopened.load("other_ns", &key()).unwrap().is_none());
    }

    #[test]
    fn test_stale_write_does_not_lower_count() {
        let store = SqliteEvPersistence::open_in_memory().unwrap();
        let p1 = EvProfile::cold(key()).with_outcome(1.0, Utc::now());
        let p2 = p1.with_outcome(1.0, Utc::now());
        store.persist("ns", &p2, 1.0).unwrap();
        store.persist("ns", &p1, 1.0).unwrap();
        assert_eq!(store.load("ns", &key()).unwrap().unwrap().trade_count, 2);
    }

    #[test]
    fn test_insert_if_absent() {
        let store = SqliteEvPersistence::open_in_memory().unwrap();
        let mut seed = EvProfile::cold(key());
        seed.trade_count = 30;
        assert!(store.insert_if_absent("ns", &seed).unwrap());
        seed.trade_count = 5;
        assert!(!store.insert_if_absent("ns", &seed).unwrap());
        assert_eq!(store.load_all().unwrap().len(), 1);
        assert_eq!(store.load("ns", &key()).unwrap().unwrap().trade_count, 30);
    }
}
