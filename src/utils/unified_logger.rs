/// 统一日志管理模块
/// 基于 log4rs 为路由器进程提供控制台 + 滚动文件输出
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 决策日志使用的 target，单独写入 decisions 文件
pub const DECISION_TARGET: &str = "decisions";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub root_dir: String,
    pub default_level: String,
    pub max_file_size_mb: u64,
    /// 保留的滚动文件个数
    pub retention_files: u32,
    pub console_output: bool,
    /// log4rs pattern 格式
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root_dir: "logs".to_string(),
            default_level: "INFO".to_string(),
            max_file_size_mb: 10,
            retention_files: 30,
            console_output: true,
            format: "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{M}] {m}{n}".to_string(),
        }
    }
}

impl LogConfig {
    /// 获取日志级别
    pub fn get_level_filter(&self) -> LevelFilter {
        match self.default_level.to_uppercase().as_str() {
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" | "WARNING" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            "OFF" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }

    pub fn system_log_path(&self) -> PathBuf {
        Path::new(&self.root_dir).join("system").join("router.log")
    }

    pub fn decision_log_path(&self) -> PathBuf {
        Path::new(&self.root_dir).join("system").join("decisions.log")
    }
}

fn rolling_appender(
    config: &LogConfig,
    path: &Path,
    pattern: &str,
) -> Result<RollingFileAppender, Box<dyn std::error::Error + Send + Sync>> {
    let roll_pattern = format!("{}.{{}}", path.display());
    let roller = FixedWindowRoller::builder().build(&roll_pattern, config.retention_files.max(1))?;
    let trigger = SizeTrigger::new(config.max_file_size_mb.max(1) * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(path, Box::new(policy))?;
    Ok(appender)
}

/// 根据配置构建 log4rs 配置（不安装）
pub fn build_log4rs_config(
    config: &LogConfig,
) -> Result<log4rs::Config, Box<dyn std::error::Error + Send + Sync>> {
    let system_dir = Path::new(&config.root_dir).join("system");
    if !system_dir.exists() {
        fs::create_dir_all(&system_dir)?;
    }

    let level = config.get_level_filter();
    let system_file = rolling_appender(config, &config.system_log_path(), &config.format)?;
    let decision_file = rolling_appender(
        config,
        &config.decision_log_path(),
        "[{d(%Y-%m-%d %H:%M:%S%.3f)}] {m}{n}",
    )?;

    let mut builder = log4rs::Config::builder()
        .appender(Appender::builder().build("system", Box::new(system_file)))
        .appender(Appender::builder().build("decisions", Box::new(decision_file)))
        .logger(
            Logger::builder()
                .appender("decisions")
                .additive(false)
                .build(DECISION_TARGET, LevelFilter::Info),
        );

    let mut root = Root::builder().appender("system");
    if config.console_output {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.format)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    Ok(builder.build(root.build(level))?)
}

/// 初始化全局日志器，进程内只能调用一次
pub fn init_global_logger(
    config: &LogConfig,
) -> Result<log4rs::Handle, Box<dyn std::error::Error + Send + Sync>> {
    let log4rs_config = build_log4rs_config(config)?;
    let handle = log4rs::init_config(log4rs_config)?;
    log::info!(
        "✅ 日志系统已初始化: 目录={}, 级别={}",
        config.root_dir,
        config.default_level
    );
    Ok(handle)
}

// 日志文件命名规范：
// - 系统日志: {root_dir}/system/router.log
// - 决策日志: {root_dir}/system/decisions.log
// - 滚动文件: {原文件}.{序号}
