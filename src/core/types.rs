use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 策略类别，决定组合层的敞口上限归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Scalping,
    Day,
    Swing,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Scalping, Category::Day, Category::Swing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Scalping => "scalping",
            Category::Day => "day",
            Category::Swing => "swing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scalping" => Some(Category::Scalping),
            "day" => Some(Category::Day),
            "swing" => Some(Category::Swing),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 闭区间 [min, max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// 状态分片键：(策略, 品种, 模式)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub strategy_id: String,
    pub instrument: String,
    pub mode: String,
}

impl SignalKey {
    pub fn new(
        strategy_id: impl Into<String>,
        instrument: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            instrument: instrument.into(),
            mode: mode.into(),
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.strategy_id, self.instrument, self.mode)
    }
}

/// 策略发出的开仓提议，仅被路由器消费一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub id: Option<String>,
    pub strategy_id: String,
    pub instrument: String,
    pub mode: String,
    pub session: String,
    pub spread: f64,
    pub realized_vol: f64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// 提议仓位的名义价值
    pub proposed_size: f64,
}

impl Signal {
    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.strategy_id, &self.instrument, &self.mode)
    }

    pub fn signal_ref(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}@{}",
                self.strategy_id,
                self.instrument,
                self.mode,
                self.timestamp.timestamp_millis()
            ),
        }
    }

    pub fn proposed_notional(&self) -> f64 {
        self.proposed_size.abs()
    }

    /// 信号相对 now 的年龄（毫秒），未来时间戳为负
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }

    /// 超出允许年龄，或时间戳领先 now 超过同样的幅度
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.age_ms(now).abs() > max_age.num_milliseconds()
    }

    /// 参与比较的浮点字段必须是有限数，NaN 会让所有上限比较失效
    pub fn has_finite_inputs(&self) -> bool {
        self.proposed_size.is_finite() && self.spread.is_finite() && self.realized_vol.is_finite()
    }
}

/// 执行层回报的已平仓结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub strategy_id: String,
    pub instrument: String,
    pub mode: String,
    pub realized_pnl: f64,
    /// 指定平仓的预留编号，缺省时按先进先出释放
    #[serde(default)]
    pub reservation_id: Option<u64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.strategy_id, &self.instrument, &self.mode)
    }
}

/// 决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Admit,
    GateBlock,
    EvBypass,
    RiskBlock,
    PortfolioBlock,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Admit => "admit",
            DecisionOutcome::GateBlock => "gate_block",
            DecisionOutcome::EvBypass => "ev_bypass",
            DecisionOutcome::RiskBlock => "risk_block",
            DecisionOutcome::PortfolioBlock => "portfolio_block",
        }
    }

    /// admit 与 ev_bypass 都会占用风险预算
    pub fn is_admitted(&self) -> bool {
        matches!(self, DecisionOutcome::Admit | DecisionOutcome::EvBypass)
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审计记录，生成后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub signal_ref: String,
    pub strategy_id: String,
    pub instrument: String,
    pub mode: String,
    pub outcome: DecisionOutcome,
    /// 按触发顺序排列的规则名
    pub reasons: Vec<String>,
    pub proposed_notional: f64,
    /// 放行时占用的风险预留编号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(signal: &Signal, outcome: DecisionOutcome, reasons: Vec<String>) -> Self {
        Self {
            signal_ref: signal.signal_ref(),
            strategy_id: signal.strategy_id.clone(),
            instrument: signal.instrument.clone(),
            mode: signal.mode.clone(),
            outcome,
            reasons,
            proposed_notional: signal.proposed_notional(),
            reservation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.strategy_id, &self.instrument, &self.mode)
    }

    /// 人类可读的原因链
    pub fn reason_chain(&self) -> String {
        if self.reasons.is_empty() {
            self.outcome.as_str().to_string()
        } else {
            format!("{} <- {}", self.outcome, self.reasons.join(" -> "))
        }
    }
}
