use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::error::{Result, RouterError};
use crate::core::traits::BudgetPersistence;
use crate::core::types::SignalKey;
use crate::portfolio::PnlTrack;

use super::budget::RiskBudgetState;

/// 内存中的风险预算存储，用于测试；可注入写失败与写延迟
#[derive(Default)]
pub struct MemoryBudgetPersistence {
    budgets: Mutex<HashMap<SignalKey, RiskBudgetState>>,
    pnl: Mutex<PnlTrack>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryBudgetPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stored(&self, key: &SignalKey) -> Option<RiskBudgetState> {
        self.budgets.lock().get(key).cloned()
    }
}

impl BudgetPersistence for MemoryBudgetPersistence {
    fn load_budgets(&self) -> Result<Vec<RiskBudgetState>> {
        let mut all: Vec<RiskBudgetState> = self.budgets.lock().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    fn save_budget(&self, state: &RiskBudgetState, pnl_sample: Option<f64>) -> Result<bool> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RouterError::Persistence("注入的写入失败".to_string()));
        }

        let mut budgets = self.budgets.lock();
        let stale = budgets
            .get(&state.key)
            .map_or(false, |existing| existing.revision >= state.revision);
        if stale {
            return Ok(false);
        }
        budgets.insert(state.key.clone(), state.clone());
        if let Some(pnl) = pnl_sample {
            self.pnl.lock().apply(pnl);
        }
        Ok(true)
    }

    fn load_portfolio_pnl(&self) -> Result<PnlTrack> {
        Ok(*self.pnl.lock())
    }
}
