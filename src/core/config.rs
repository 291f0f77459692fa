use crate::core::error::{Result, RouterError};
use crate::core::types::Category;
use crate::utils::unified_logger::LogConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// EV 绕行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvBypassConfig {
    /// 信噪比阈值: expected_value / sqrt(variance_estimate) 必须严格大于该值
    pub snr_threshold: f64,
    /// 方差低于该值时视为信噪比无穷大
    pub min_variance: f64,
}

impl Default for EvBypassConfig {
    fn default() -> Self {
        Self {
            snr_threshold: 0.5,
            min_variance: 1e-12,
        }
    }
}

/// 各类别的名义敞口上限，未配置的类别不设上限
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryCaps {
    pub scalping: Option<f64>,
    pub day: Option<f64>,
    pub swing: Option<f64>,
}

impl CategoryCaps {
    pub fn get(&self, category: Category) -> Option<f64> {
        match category {
            Category::Scalping => self.scalping,
            Category::Day => self.day,
            Category::Swing => self.swing,
        }
    }

    pub fn set(&mut self, category: Category, cap: Option<f64>) {
        match category {
            Category::Scalping => self.scalping = cap,
            Category::Day => self.day = cap,
            Category::Swing => self.swing = cap,
        }
    }
}

/// 组合层限额
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioLimits {
    pub category_caps: CategoryCaps,
    /// 组合已实现盈亏序列的最大回撤上限（绝对金额）
    pub max_aggregate_drawdown: f64,
}

impl Default for PortfolioLimits {
    fn default() -> Self {
        Self {
            category_caps: CategoryCaps {
                scalping: Some(100_000.0),
                day: Some(250_000.0),
                swing: Some(500_000.0),
            },
            max_aggregate_drawdown: 50_000.0,
        }
    }
}

/// 存储与导出路径
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// EV 画像与风险预算共用的 SQLite 文件
    pub ev_db_path: String,
    pub audit_log_path: String,
    /// 每条审计记录写入后 fsync
    pub audit_fsync: bool,
    pub snapshot_dir: String,
    /// 组合快照导出周期（秒），0 表示不启动周期任务
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ev_db_path: "data/ev_profiles.db".to_string(),
            audit_log_path: "data/decisions.jsonl".to_string(),
            audit_fsync: true,
            snapshot_dir: "data/snapshots".to_string(),
            snapshot_interval_secs: 60,
        }
    }
}

/// 路由器全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// 策略清单文件或目录
    pub manifest_paths: Vec<String>,
    pub ev_bypass: EvBypassConfig,
    /// 信号最大允许年龄（毫秒）
    pub max_signal_age_ms: u64,
    /// EV 读取的截止时间（毫秒），超时按 risk_block 处理
    pub persistence_timeout_ms: u64,
    pub portfolio: PortfolioLimits,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            manifest_paths: vec!["manifests".to_string()],
            ev_bypass: EvBypassConfig::default(),
            max_signal_age_ms: 5_000,
            persistence_timeout_ms: 250,
            portfolio: PortfolioLimits::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl RouterConfig {
    /// 从配置文件加载，ROUTER__ 前缀的环境变量可覆盖任意字段
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: RouterConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ev_bypass.snr_threshold >= 0.0) {
            return Err(RouterError::ConfigError(format!(
                "ev_bypass.snr_threshold 必须为非负数: {}",
                self.ev_bypass.snr_threshold
            )));
        }
        if self.persistence_timeout_ms == 0 {
            return Err(RouterError::ConfigError(
                "persistence_timeout_ms 必须大于0".to_string(),
            ));
        }
        for category in Category::ALL {
            if let Some(cap) = self.portfolio.category_caps.get(category) {
                if !(cap > 0.0) {
                    return Err(RouterError::ConfigError(format!(
                        "类别 {} 的敞口上限必须大于0: {}",
                        category, cap
                    )));
                }
            }
        }
        if !(self.portfolio.max_aggregate_drawdown > 0.0) {
            return Err(RouterError::ConfigError(format!(
                "portfolio.max_aggregate_drawdown 必须大于0: {}",
                self.portfolio.max_aggregate_drawdown
            )));
        }
        Ok(())
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    pub fn max_signal_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_signal_age_ms as i64)
    }
}
