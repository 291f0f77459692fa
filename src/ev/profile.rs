use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::SignalKey;

/// (策略, 品种, 模式) 的期望收益画像
///
/// `expected_value` 为增量均值，`variance_estimate` 为 Welford 样本方差，
/// `m2` 是 Welford 的二阶累积量，持久化时一并保存以便无损恢复。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvProfile {
    pub key: SignalKey,
    pub trade_count: u64,
    pub expected_value: f64,
    pub variance_estimate: f64,
    #[serde(default)]
    pub m2: f64,
    pub last_updated: DateTime<Utc>,
}

impl EvProfile {
    /// 冷启动画像：零次交易
    pub fn cold(key: SignalKey) -> Self {
        Self {
            key,
            trade_count: 0,
            expected_value: 0.0,
            variance_estimate: 0.0,
            m2: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// 计入一笔已实现盈亏，返回新画像（自身不变）
    pub fn with_outcome(&self, realized_pnl: f64, now: DateTime<Utc>) -> Self {
        let n = self.trade_count + 1;
        let delta = realized_pnl - self.expected_value;
        let mean = self.expected_value + delta / n as f64;
        let m2 = self.m2 + delta * (realized_pnl - mean);
        let variance = if n > 1 { m2 / (n - 1) as f64 } else { 0.0 };

        Self {
            key: self.key.clone(),
            trade_count: n,
            expected_value: mean,
            variance_estimate: variance,
            m2,
            last_updated: now,
        }
    }

    pub fn is_warm(&self, warmup_trades: u64) -> bool {
        self.trade_count >= warmup_trades
    }

    /// 信噪比 expected_value / sqrt(variance)；方差不超过 min_variance 时为无穷大
    pub fn signal_to_noise(&self, min_variance: f64) -> f64 {
        if self.variance_estimate <= min_variance {
            if self.expected_value > 0.0 {
                f64::INFINITY
            } else if self.expected_value < 0.0 {
                f64::NEG_INFINITY
            } else {
                0.0
            }
        } else {
            self.expected_value / self.variance_estimate.sqrt()
        }
    }
}
