//! 组合层聚合视图
//! 所有写入都经过同一把聚合锁，读取拿到的是完整副本

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::config::PortfolioLimits;
use crate::core::reasons;
use crate::core::types::{Category, SignalKey};

pub const SCHEMA_VERSION: u32 = 1;

const EXPOSURE_EPSILON: f64 = 1e-9;

/// 组合状态（对外快照格式，只做增量式字段变更）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub schema_version: u32,
    pub category_exposure: BTreeMap<Category, f64>,
    pub category_caps: BTreeMap<Category, f64>,
    /// exposure / cap，未设上限的类别不出现
    pub utilization: BTreeMap<Category, f64>,
    pub aggregate_drawdown: f64,
    pub max_aggregate_drawdown: f64,
    pub cumulative_pnl: f64,
    pub pnl_peak: f64,
    pub active_strategies: BTreeSet<String>,
    pub taken_at: DateTime<Utc>,
}

/// 组合已实现盈亏轨迹，随风险预算一起持久化
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlTrack {
    pub cumulative_pnl: f64,
    pub pnl_peak: f64,
    pub drawdown: f64,
}

impl PnlTrack {
    pub fn apply(&mut self, pnl: f64) {
        self.cumulative_pnl += pnl;
        if self.cumulative_pnl > self.pnl_peak {
            self.pnl_peak = self.cumulative_pnl;
        }
        let trough = self.pnl_peak - self.cumulative_pnl;
        if trough > self.drawdown {
            self.drawdown = trough;
        }
    }
}

/// 一次组合变更
#[derive(Debug, Clone)]
pub struct PortfolioDelta {
    pub key: SignalKey,
    pub category: Category,
    pub notional_delta: f64,
    /// 平仓时的已实现盈亏样本，计入组合回撤序列
    pub drawdown_sample: Option<f64>,
}

struct Inner {
    state: PortfolioState,
    key_exposure: HashMap<SignalKey, (Category, f64)>,
}

impl Inner {
    fn check(&self, category: Category, notional: f64) -> Result<(), &'static str> {
        if let Some(cap) = self.state.category_caps.get(&category) {
            let current = self
                .state
                .category_exposure
                .get(&category)
                .copied()
                .unwrap_or(0.0);
            if !(current + notional <= *cap) {
                return Err(reasons::CATEGORY_CAP_EXCEEDED);
            }
        }
        if !(self.state.aggregate_drawdown < self.state.max_aggregate_drawdown) {
            return Err(reasons::AGGREGATE_DRAWDOWN_EXCEEDED);
        }
        Ok(())
    }

    fn apply(&mut self, delta: &PortfolioDelta) {
        let entry = self
            .key_exposure
            .entry(delta.key.clone())
            .or_insert((delta.category, 0.0));
        entry.1 += delta.notional_delta;
        if entry.1 < -EXPOSURE_EPSILON {
            log::warn!(
                "⚠️ {} 的组合敞口为负 ({:.6})，已归零",
                delta.key,
                entry.1
            );
        }
        if entry.1 <= EXPOSURE_EPSILON {
            self.key_exposure.remove(&delta.key);
        }

        if let Some(pnl) = delta.drawdown_sample {
            let mut track = self.pnl_track();
            track.apply(pnl);
            self.set_pnl_track(track);
        }

        self.refresh();
    }

    fn pnl_track(&self) -> PnlTrack {
        PnlTrack {
            cumulative_pnl: self.state.cumulative_pnl,
            pnl_peak: self.state.pnl_peak,
            drawdown: self.state.aggregate_drawdown,
        }
    }

    fn set_pnl_track(&mut self, track: PnlTrack) {
        self.state.cumulative_pnl = track.cumulative_pnl;
        self.state.pnl_peak = track.pnl_peak;
        self.state.aggregate_drawdown = track.drawdown;
    }

    // 类别敞口由键级敞口重新求和，避免浮点累积误差
    fn refresh(&mut self) {
        let exposures = PortfolioAggregator::recompute(
            self.key_exposure.values().map(|(category, notional)| (*category, *notional)),
        );
        let mut utilization = BTreeMap::new();
        for (category, cap) in &self.state.category_caps {
            let used = exposures.get(category).copied().unwrap_or(0.0);
            if *cap > 0.0 {
                utilization.insert(*category, used / cap);
            }
        }
        self.state.category_exposure = exposures;
        self.state.utilization = utilization;
        self.state.active_strategies = self
            .key_exposure
            .keys()
            .map(|key| key.strategy_id.clone())
            .collect();
    }
}

/// 组合聚合器
pub struct PortfolioAggregator {
    inner: RwLock<Inner>,
}

impl PortfolioAggregator {
    pub fn new(limits: &PortfolioLimits) -> Self {
        let category_caps = Category::ALL
            .iter()
            .filter_map(|c| limits.category_caps.get(*c).map(|cap| (*c, cap)))
            .collect();
        let mut inner = Inner {
            state: PortfolioState {
                schema_version: SCHEMA_VERSION,
                category_exposure: BTreeMap::new(),
                category_caps,
                utilization: BTreeMap::new(),
                aggregate_drawdown: 0.0,
                max_aggregate_drawdown: limits.max_aggregate_drawdown,
                cumulative_pnl: 0.0,
                pnl_peak: 0.0,
                active_strategies: BTreeSet::new(),
                taken_at: Utc::now(),
            },
            key_exposure: HashMap::new(),
        };
        inner.refresh();
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// 只检查不修改
    pub fn check(&self, category: Category, notional: f64) -> Result<(), &'static str> {
        self.inner.read().check(category, notional)
    }

    /// 在同一把写锁内检查并计入敞口，并发放行不会越过上限
    pub fn try_admit(
        &self,
        key: &SignalKey,
        category: Category,
        notional: f64,
    ) -> Result<(), &'static str> {
        if !notional.is_finite() {
            return Err(reasons::INVALID_SIGNAL);
        }
        let mut inner = self.inner.write();
        inner.check(category, notional)?;
        inner.apply(&PortfolioDelta {
            key: key.clone(),
            category,
            notional_delta: notional,
            drawdown_sample: None,
        });
        Ok(())
    }

    pub fn apply_delta(&self, delta: PortfolioDelta) {
        self.inner.write().apply(&delta);
    }

    /// 重启恢复：用持久化的未平仓敞口与盈亏轨迹替换当前视图
    pub fn restore<I>(&self, open: I, pnl: PnlTrack)
    where
        I: IntoIterator<Item = (SignalKey, Category, f64)>,
    {
        let mut inner = self.inner.write();
        inner.key_exposure.clear();
        for (key, category, notional) in open {
            if notional > EXPOSURE_EPSILON {
                let entry = inner.key_exposure.entry(key).or_insert((category, 0.0));
                entry.1 += notional;
            }
        }
        inner.set_pnl_track(pnl);
        inner.refresh();
    }

    pub fn snapshot(&self) -> PortfolioState {
        let mut state = self.inner.read().state.clone();
        state.taken_at = Utc::now();
        state
    }

    pub fn exposure(&self, category: Category) -> f64 {
        self.inner
            .read()
            .state
            .category_exposure
            .get(&category)
            .copied()
            .unwrap_or(0.0)
    }

    /// 由未平仓明细从头计算类别敞口
    pub fn recompute<I>(open_positions: I) -> BTreeMap<Category, f64>
    where
        I: IntoIterator<Item = (Category, f64)>,
    {
        let mut exposures: BTreeMap<Category, f64> =
            Category::ALL.iter().map(|c| (*c, 0.0)).collect();
        for (category, notional) in open_positions {
            *exposures.entry(category).or_insert(0.0) += notional;
        }
        exposures
    }
}
