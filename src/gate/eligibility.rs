//! 准入门：纯函数，只比较信号上下文与清单区间
//!
//! 检查顺序固定（时段 → 点差 → 波动率 → 延迟），遇到第一个失败即返回。

use crate::core::reasons;
use crate::core::types::Signal;
use crate::manifest::StrategyManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail(&'static str),
}

impl GateVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }
}

pub fn evaluate(signal: &Signal, manifest: &StrategyManifest) -> GateVerdict {
    let rules = &manifest.router;

    if !rules.allows_session(&signal.session) {
        return GateVerdict::Fail(reasons::SESSION_NOT_ALLOWED);
    }
    if !rules.spread_band.contains(signal.spread) {
        return GateVerdict::Fail(reasons::SPREAD_OUT_OF_BAND);
    }
    if !rules.rv_band.contains(signal.realized_vol) {
        return GateVerdict::Fail(reasons::RV_OUT_OF_BAND);
    }
    if signal.latency_ms > rules.latency_cap_ms {
        return GateVerdict::Fail(reasons::LATENCY_CAP_EXCEEDED);
    }

    GateVerdict::Pass
}
