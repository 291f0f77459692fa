use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

use crate::core::error::{Result, RouterError};
use crate::core::types::{Band, Category};

/// 清单必须包含的顶层块
pub const REQUIRED_BLOCKS: [&str; 4] = ["meta", "strategy", "router", "risk"];

/// 清单中的区间既可写成 [min, max] 也可写成 {min, max}
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BandSpec {
    Pair([f64; 2]),
    Range { min: f64, max: f64 },
}

impl From<BandSpec> for Band {
    fn from(spec: BandSpec) -> Self {
        match spec {
            BandSpec::Pair([min, max]) => Band::new(min, max),
            BandSpec::Range { min, max } => Band::new(min, max),
        }
    }
}

fn de_band<'de, D>(deserializer: D) -> std::result::Result<Band, D::Error>
where
    D: Deserializer<'de>,
{
    BandSpec::deserialize(deserializer).map(Band::from)
}

/// version 字段在 YAML 里常被写成数字（1.0），统一转成字符串
fn de_stringish<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct MetaBlock {
    id: String,
    #[serde(default)]
    name: String,
    category: String,
    #[serde(default, deserialize_with = "de_stringish")]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StrategyBlock {
    #[serde(default)]
    class_path: String,
    #[serde(default)]
    instruments: Vec<InstrumentSpec>,
    #[serde(default)]
    params: Mapping,
}

#[derive(Debug, Clone, Deserialize)]
struct RouterBlock {
    #[serde(default)]
    allowed_sessions: Vec<String>,
    #[serde(deserialize_with = "de_band")]
    spread_band: Band,
    #[serde(deserialize_with = "de_band")]
    rv_band: Band,
    latency_cap_ms: u64,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestDocument {
    meta: MetaBlock,
    strategy: StrategyBlock,
    router: RouterBlock,
    risk: RiskRules,
    #[serde(default)]
    features: FeatureSet,
    #[serde(default)]
    runner: Option<RunnerSpec>,
    #[serde(default)]
    state: StateSpec,
    #[serde(default)]
    notes: Option<String>,
}

/// 清单中的交易品种
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub timeframe: String,
    /// 未指定时匹配任意模式
    #[serde(default)]
    pub mode: Option<String>,
}

impl InstrumentSpec {
    pub fn matches(&self, symbol: &str, mode: &str) -> bool {
        self.symbol == symbol && self.mode.as_deref().map_or(true, |m| m == mode)
    }
}

/// 路由准入规则
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterRules {
    pub allowed_sessions: Vec<String>,
    pub spread_band: Band,
    pub rv_band: Band,
    pub latency_cap_ms: u64,
    pub tags: Vec<String>,
}

impl RouterRules {
    /// "*" 表示任意时段
    pub fn allows_session(&self, session: &str) -> bool {
        self.allowed_sessions
            .iter()
            .any(|s| s == "*" || s.eq_ignore_ascii_case(session))
    }
}

/// 风险预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRules {
    /// 单笔风险占 max_notional 的比例 (0, 1]
    pub risk_per_trade: f64,
    /// 键级已实现盈亏最大回撤（绝对金额）
    pub max_drawdown: f64,
    pub max_notional: f64,
    pub max_concurrent: u32,
    #[serde(default)]
    pub warmup_trades: u64,
}

impl RiskRules {
    /// 单笔名义价值参考上限
    pub fn per_trade_notional(&self) -> f64 {
        self.max_notional * self.risk_per_trade
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    #[serde(default)]
    pub runner_config: Option<String>,
    #[serde(default)]
    pub cli_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    /// EV 画像的归档命名空间，缺省为策略 id
    #[serde(default)]
    pub archive_namespace: Option<String>,
    /// EV 快照文件路径，启动时导入尚未持久化的键
    #[serde(default)]
    pub ev_profile_seed: Option<String>,
}

/// 加载后不可变的策略清单
#[derive(Debug, Clone)]
pub struct StrategyManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category: Category,
    pub class_path: String,
    pub instruments: Vec<InstrumentSpec>,
    pub params: Mapping,
    pub router: RouterRules,
    pub risk: RiskRules,
    pub features: FeatureSet,
    pub runner: Option<RunnerSpec>,
    pub state: StateSpec,
    pub notes: Option<String>,
    pub source: PathBuf,
}

impl StrategyManifest {
    /// 从 YAML 文本解析并校验
    pub fn from_yaml_str(contents: &str, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let origin = source.display().to_string();

        let value: Value = serde_yaml::from_str(contents)
            .map_err(|e| RouterError::manifest(&origin, format!("YAML解析失败: {}", e)))?;
        let mapping = value
            .as_mapping()
            .ok_or_else(|| RouterError::manifest(&origin, "顶层必须是映射"))?;

        let missing: Vec<&str> = REQUIRED_BLOCKS
            .iter()
            .copied()
            .filter(|block| !mapping.contains_key(*block))
            .collect();
        if !missing.is_empty() {
            return Err(RouterError::manifest(
                &origin,
                format!("缺少必需的块: {}", missing.join(", ")),
            ));
        }

        let doc: ManifestDocument = serde_yaml::from_value(value)
            .map_err(|e| RouterError::manifest(&origin, format!("字段错误: {}", e)))?;

        Self::from_document(doc, source)
    }

    fn from_document(doc: ManifestDocument, source: PathBuf) -> Result<Self> {
        let origin = source.display().to_string();

        let category = Category::parse(doc.meta.category.trim()).ok_or_else(|| {
            RouterError::manifest(
                &origin,
                format!(
                    "category 必须是 scalping|day|swing 之一: {}",
                    doc.meta.category
                ),
            )
        })?;

        let manifest = StrategyManifest {
            id: doc.meta.id.trim().to_string(),
            name: doc.meta.name,
            version: doc.meta.version,
            description: doc.meta.description,
            tags: doc.meta.tags,
            category,
            class_path: doc.strategy.class_path,
            instruments: doc.strategy.instruments,
            params: doc.strategy.params,
            router: RouterRules {
                allowed_sessions: doc.router.allowed_sessions,
                spread_band: doc.router.spread_band,
                rv_band: doc.router.rv_band,
                latency_cap_ms: doc.router.latency_cap_ms,
                tags: doc.router.tags,
            },
            risk: doc.risk,
            features: doc.features,
            runner: doc.runner,
            state: doc.state,
            notes: doc.notes,
            source,
        };

        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let origin = self.source.display().to_string();
        let fail = |reason: String| Err(RouterError::manifest(&origin, reason));

        if self.id.is_empty() {
            return fail("meta.id 不能为空".to_string());
        }
        if self.instruments.is_empty() {
            return fail("strategy.instruments 不能为空".to_string());
        }
        for instrument in &self.instruments {
            if !is_valid_symbol(&instrument.symbol) {
                return fail(format!(
                    "品种代码必须为大写: {:?}",
                    instrument.symbol
                ));
            }
            if !is_valid_timeframe(&instrument.timeframe) {
                return fail(format!(
                    "品种 {} 的 timeframe 格式错误: {:?}",
                    instrument.symbol, instrument.timeframe
                ));
            }
        }

        if self.router.allowed_sessions.is_empty() {
            return fail("router.allowed_sessions 不能为空".to_string());
        }
        for (name, band) in [
            ("spread_band", &self.router.spread_band),
            ("rv_band", &self.router.rv_band),
        ] {
            if !(band.min >= 0.0) || !(band.max >= band.min) {
                return fail(format!(
                    "router.{} 区间非法: [{}, {}]",
                    name, band.min, band.max
                ));
            }
        }
        if self.router.latency_cap_ms == 0 {
            return fail("router.latency_cap_ms 必须大于0".to_string());
        }

        let risk = &self.risk;
        if !(risk.risk_per_trade > 0.0 && risk.risk_per_trade <= 1.0) {
            return fail(format!(
                "risk.risk_per_trade 必须在 (0, 1] 内: {}",
                risk.risk_per_trade
            ));
        }
        if !(risk.max_drawdown > 0.0) {
            return fail(format!("risk.max_drawdown 必须大于0: {}", risk.max_drawdown));
        }
        if !(risk.max_notional > 0.0) {
            return fail(format!("risk.max_notional 必须大于0: {}", risk.max_notional));
        }
        if risk.max_concurrent == 0 {
            return fail("risk.max_concurrent 必须大于0".to_string());
        }

        Ok(())
    }

    pub fn archive_namespace(&self) -> String {
        self.state
            .archive_namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.id)
            .to_string()
    }

    pub fn find_instrument(&self, symbol: &str, mode: &str) -> Option<&InstrumentSpec> {
        self.instruments.iter().find(|i| i.matches(symbol, mode))
    }
}

/// 大写字母/数字，可含 . _ / -，且至少一个字母
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.chars().any(|c| c.is_ascii_uppercase())
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "._/-".contains(c))
}

/// <正整数><s|m|h|d|w|M>，例如 1m、15m、4h、1d
pub fn is_valid_timeframe(timeframe: &str) -> bool {
    let Some(unit) = timeframe.chars().last() else {
        return false;
    };
    let digits = &timeframe[..timeframe.len() - unit.len_utf8()];
    matches!(unit, 's' | 'm' | 'h' | 'd' | 'w' | 'M')
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && digits.parse::<u32>().map_or(false, |n| n > 0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
meta:
  id: scalp_btc
  name: BTC剥头皮
  category: scalping
  version: 1.2
  description: 测试用清单
  tags: [crypto, fast]
strategy:
  class_path: strategies.scalp.BtcScalper
  instruments:
    - symbol: BTCUSDT
      timeframe: 1m
      mode: live
    - symbol: ETHUSDT
      timeframe: 5m
  params:
    lookback: 20
router:
  allowed_sessions: [asia, london]
  spread_band: [0.0, 2.5]
  rv_band: {min: 0.1, max: 0.9}
  latency_cap_ms: 150
risk:
  risk_per_trade: 0.1
  max_drawdown: 1000
  max_notional: 50000
  max_concurrent: 2
  warmup_trades: 20
state:
  archive_namespace: scalp_v1
notes: 仅用于测试
"#;

    #[test]
    fn test_parse_full_manifest() {
        let m = StrategyManifest::from_yaml_str(SAMPLE, "sample.yml").unwrap();
        assert_eq!(m.id, "scalp_btc");
        assert_eq!(m.category, Category::Scalping);
        assert_eq!(m.version, "1.2");
        assert_eq!(m.router.spread_band, Band::new(0.0, 2.5));
        assert_eq!(m.router.rv_band, Band::new(0.1, 0.9));
        assert_eq!(m.risk.warmup_trades, 20);
        assert_eq!(m.archive_namespace(), "scalp_v1");
        assert_eq!(m.risk.per_trade_notional(), 5000.0);
        assert!(m.find_instrument("BTCUSDT", "live").is_some());
        assert!(m.find_instrument("BTCUSDT", "paper").is_none());
        // 未指定 mode 的品种匹配任意模式
        assert!(m.find_instrument("ETHUSDT", "paper").is_some());
    }

    #[test]
    fn test_missing_block_is_rejected() {
        let without_risk = SAMPLE.split("risk:\n").next().unwrap().to_string();
        let err = StrategyManifest::from_yaml_str(&without_risk, "bad.yml").unwrap_err();
        match err {
            RouterError::ManifestValidation { reason, .. } => assert!(reason.contains("risk")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_category_is_rejected() {
        let yaml = SAMPLE.replace("category: scalping", "category: hft");
        let err = StrategyManifest::from_yaml_str(&yaml, "bad.yml").unwrap_err();
        assert!(matches!(err, RouterError::ManifestValidation { .. }));
    }

    #[test]
    fn test_lowercase_symbol_is_rejected() {
        let yaml = SAMPLE.replace("symbol: BTCUSDT", "symbol: btcusdt");
        assert!(StrategyManifest::from_yaml_str(&yaml, "bad.yml").is_err());
    }

    #[test]
    fn test_malformed_timeframe_is_rejected() {
        let yaml = SAMPLE.replace("timeframe: 1m", "timeframe: 1x");
        assert!(StrategyManifest::from_yaml_str(&yaml, "bad.yml").is_err());
    }

    #[test]
    fn test_symbol_and_timeframe_rules() {
        assert!(is_valid_symbol("BTC-PERP"));
        assert!(is_valid_symbol("EUR/USD"));
        assert!(!is_valid_symbol("1000"));
        assert!(!is_valid_symbol("BtcUsdt"));
        assert!(is_valid_timeframe("15m"));
        assert!(is_valid_timeframe("1M"));
        assert!(!is_valid_timeframe("m"));
        assert!(!is_valid_timeframe("0h"));
        assert!(!is_valid_timeframe(""));
    }

    #[test]
    fn test_inverted_band_is_rejected() {
        let yaml = SAMPLE.replace("spread_band: [0.0, 2.5]", "spread_band: [3.0, 2.5]");
        assert!(StrategyManifest::from_yaml_str(&yaml, "bad.yml").is_err());
    }
}
