//! 决策原因码，写入 DecisionRecord.reasons，审计回放按字面值匹配

// 清单查找
pub const UNKNOWN_STRATEGY: &str = "unknown_strategy";
pub const UNKNOWN_INSTRUMENT: &str = "unknown_instrument";

// 时效与输入
pub const STALE_SIGNAL: &str = "stale_signal";
pub const INVALID_SIGNAL: &str = "invalid_signal";

// 准入门
pub const SESSION_NOT_ALLOWED: &str = "session_not_allowed";
pub const SPREAD_OUT_OF_BAND: &str = "spread_out_of_band";
pub const RV_OUT_OF_BAND: &str = "rv_out_of_band";
pub const LATENCY_CAP_EXCEEDED: &str = "latency_cap_exceeded";

// EV 绕行
pub const EV_BYPASS: &str = "ev_bypass";
pub const EV_WARMUP_INCOMPLETE: &str = "ev_warmup_incomplete";
pub const EV_NON_POSITIVE: &str = "ev_non_positive";
pub const EV_SNR_BELOW_THRESHOLD: &str = "ev_snr_below_threshold";
pub const PERSISTENCE_TIMEOUT: &str = "persistence_timeout";

// 风险预算
pub const MAX_CONCURRENT_EXCEEDED: &str = "max_concurrent_exceeded";
pub const MAX_NOTIONAL_EXCEEDED: &str = "max_notional_exceeded";
pub const MAX_DRAWDOWN_BREACHED: &str = "max_drawdown_breached";
pub const ROUTER_HALTED: &str = "router_halted";

// 组合
pub const CATEGORY_CAP_EXCEEDED: &str = "category_cap_exceeded";
pub const AGGREGATE_DRAWDOWN_EXCEEDED: &str = "aggregate_drawdown_exceeded";
