use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

use crate::core::error::Result;
use crate::core::traits::BudgetPersistence;
use crate::portfolio::PnlTrack;

use super::budget::RiskBudgetState;

// 与 EV 存储共用同一个数据库文件，各自持有连接
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite 风险预算存储：risk_budgets 每键一行，portfolio_pnl 只有一行
pub struct SqliteBudgetPersistence {
    conn: Mutex<Connection>,
}

impl SqliteBudgetPersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS risk_budgets (
                strategy_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                mode TEXT NOT NULL,
                revision INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (strategy_id, instrument, mode)
            );
            CREATE TABLE IF NOT EXISTS portfolio_pnl (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cumulative_pnl REAL NOT NULL,
                pnl_peak REAL NOT NULL,
                aggregate_drawdown REAL NOT NULL
            );
            INSERT OR IGNORE INTO portfolio_pnl (id, cumulative_pnl, pnl_peak, aggregate_drawdown)
                VALUES (1, 0.0, 0.0, 0.0);
            COMMIT;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl BudgetPersistence for SqliteBudgetPersistence {
    fn load_budgets(&self) -> Result<Vec<RiskBudgetState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT state FROM risk_budgets ORDER BY strategy_id, instrument, mode",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut budgets = Vec::with_capacity(rows.len());
        for raw in rows {
            budgets.push(serde_json::from_str::<RiskBudgetState>(&raw)?);
        }
        Ok(budgets)
    }

    fn save_budget(&self, state: &RiskBudgetState, pnl_sample: Option<f64>) -> Result<bool> {
        let encoded = serde_json::to_string(state)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = &state.key;
        // revision 单调递增：超时后才落地的旧写入不覆盖新状态
        let changed = tx.execute(
            "INSERT INTO risk_budgets (strategy_id, instrument, mode, revision, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(strategy_id, instrument, mode) DO UPDATE SET
                revision = excluded.revision,
                state = excluded.state,
                updated_at = excluded.updated_at
             WHERE excluded.revision > risk_budgets.revision",
            params![
                key.strategy_id,
                key.instrument,
                key.mode,
                state.revision as i64,
                encoded,
                Utc::now()
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        if let Some(pnl) = pnl_sample {
            // 右侧表达式读取的都是更新前的值
            tx.execute(
                "UPDATE portfolio_pnl SET
                    cumulative_pnl = cumulative_pnl + ?1,
                    pnl_peak = MAX(pnl_peak, cumulative_pnl + ?1),
                    aggregate_drawdown = MAX(
                        aggregate_drawdown,
                        MAX(pnl_peak, cumulative_pnl + ?1) - (cumulative_pnl + ?1)
                    )
                 WHERE id = 1",
                params![pnl],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn load_portfolio_pnl(&self) -> Result<PnlTrack> {
        let conn = self.conn.lock();
        let track = conn.query_row(
            "SELECT cumulative_pnl, pnl_peak, aggregate_drawdown FROM portfolio_pnl WHERE id = 1",
            [],
            |row| {
                Ok(PnlTrack {
                    cumulative_pnl: row.get(0)?,
                    pnl_peak: row.get(1)?,
                    drawdown: row.get(2)?,
                })
            },
        )?;
        Ok(track)
    }
}
