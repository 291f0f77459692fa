//! 键级风险预算
//! 每个 (策略, 品种, 模式) 一份状态，由路由器在键锁内读写

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::{Result, RouterError};
use crate::core::reasons;
use crate::core::types::{Signal, SignalKey};
use crate::manifest::StrategyManifest;

static NEXT_RESERVATION_ID: AtomicU64 = AtomicU64::new(1);

/// 恢复持久化预留后调用，保证新编号不与已有预留重复
pub fn advance_reservation_ids(last_used: u64) {
    NEXT_RESERVATION_ID.fetch_max(last_used.saturating_add(1), Ordering::SeqCst);
}

/// 一笔未平仓的预留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenReservation {
    pub id: u64,
    pub notional: f64,
    pub opened_at: DateTime<Utc>,
}

/// 风险预算状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBudgetState {
    pub key: SignalKey,
    pub open_notional: f64,
    pub trade_count_since_warmup: u64,
    /// 已实现盈亏的历史最大回撤（绝对金额，只增不减）
    pub current_drawdown: f64,
    pub concurrent_open: u32,
    pub cumulative_pnl: f64,
    pub pnl_peak: f64,
    pub open_positions: VecDeque<OpenReservation>,
    /// 每次变更加一，持久化层据此丢弃过期写入
    #[serde(default)]
    pub revision: u64,
}

impl RiskBudgetState {
    pub fn new(key: SignalKey) -> Self {
        Self {
            key,
            open_notional: 0.0,
            trade_count_since_warmup: 0,
            current_drawdown: 0.0,
            concurrent_open: 0,
            cumulative_pnl: 0.0,
            pnl_peak: 0.0,
            open_positions: VecDeque::new(),
            revision: 0,
        }
    }

    pub fn last_reservation_id(&self) -> Option<u64> {
        self.open_positions.iter().map(|p| p.id).max()
    }

    // 由持仓列表重算，预留与释放往返后精确回到原值
    fn resync(&mut self) {
        self.concurrent_open = self.open_positions.len() as u32;
        self.open_notional = self.open_positions.iter().map(|p| p.notional).sum();
        self.revision += 1;
    }
}

/// 预留成功的凭据
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: u64,
    pub key: SignalKey,
    pub notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Reserved(Reservation),
    Block(&'static str),
}

/// 释放结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedPosition {
    pub id: u64,
    pub notional: f64,
    pub realized_pnl: f64,
    pub drawdown_after: f64,
}

/// 风险预算执行器，本身无状态
#[derive(Debug, Default, Clone)]
pub struct RiskBudgetEnforcer;

impl RiskBudgetEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// 依次检查并发数、名义价值、回撤，全部通过则预留
    pub fn check_and_reserve(
        &self,
        signal: &Signal,
        manifest: &StrategyManifest,
        state: &mut RiskBudgetState,
    ) -> RiskVerdict {
        let rules = &manifest.risk;
        let proposed = signal.proposed_notional();
        if !proposed.is_finite() {
            return RiskVerdict::Block(reasons::INVALID_SIGNAL);
        }

        // 比较写成“未满足上限即拦截”，非有限数不会漏过
        if state.concurrent_open >= rules.max_concurrent {
            return RiskVerdict::Block(reasons::MAX_CONCURRENT_EXCEEDED);
        }
        if !(state.open_notional + proposed <= rules.max_notional) {
            return RiskVerdict::Block(reasons::MAX_NOTIONAL_EXCEEDED);
        }
        if !(state.current_drawdown < rules.max_drawdown) {
            return RiskVerdict::Block(reasons::MAX_DRAWDOWN_BREACHED);
        }

        let id = NEXT_RESERVATION_ID.fetch_add(1, Ordering::Relaxed);
        state.open_positions.push_back(OpenReservation {
            id,
            notional: proposed,
            opened_at: Utc::now(),
        });
        state.resync();

        RiskVerdict::Reserved(Reservation {
            id,
            key: state.key.clone(),
            notional: proposed,
        })
    }

    /// 平仓释放：指定 id 或最早的一笔；没有可释放的预留即为泄漏
    pub fn release(
        &self,
        state: &mut RiskBudgetState,
        reservation_id: Option<u64>,
        realized_pnl: f64,
    ) -> Result<ReleasedPosition> {
        let index = match reservation_id {
            Some(id) => state.open_positions.iter().position(|p| p.id == id),
            None => {
                if state.open_positions.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        };

        let Some(position) = index.and_then(|i| state.open_positions.remove(i)) else {
            let detail = match reservation_id {
                Some(id) => format!("预留 #{} 不存在", id),
                None => "没有未平仓的预留".to_string(),
            };
            return Err(RouterError::ReservationLeak {
                key: state.key.to_string(),
                detail,
            });
        };
        state.resync();

        state.cumulative_pnl += realized_pnl;
        if state.cumulative_pnl > state.pnl_peak {
            state.pnl_peak = state.cumulative_pnl;
        }
        let trough = state.pnl_peak - state.cumulative_pnl;
        if trough > state.current_drawdown {
            state.current_drawdown = trough;
        }
        state.trade_count_since_warmup += 1;

        Ok(ReleasedPosition {
            id: position.id,
            notional: position.notional,
            realized_pnl,
            drawdown_after: state.current_drawdown,
        })
    }

    /// 撤销一笔刚做的预留，不计盈亏
    pub fn rollback(&self, state: &mut RiskBudgetState, reservation_id: u64) -> bool {
        let before = state.open_positions.len();
        state.open_positions.retain(|p| p.id != reservation_id);
        let removed = state.open_positions.len() != before;
        if removed {
            state.resync();
        }
        removed
    }

    /// 人工复位：清空回撤与盈亏统计，保留未平仓预留
    pub fn reset(&self, state: &mut RiskBudgetState) {
        state.current_drawdown = 0.0;
        state.cumulative_pnl = 0.0;
        state.pnl_peak = 0.0;
        state.trade_count_since_warmup = 0;
        state.resync();
        log::warn!("⚠️ 风险预算已人工复位: {}", state.key);
    }
}
