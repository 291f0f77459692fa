use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::error::Result;
use crate::utils::atomic_file::write_json_atomic;

use super::aggregator::{PortfolioAggregator, PortfolioState};

pub const LATEST_FILE: &str = "portfolio_latest.json";

/// 组合快照导出器
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    dir: PathBuf,
}

impl SnapshotExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    /// 写入带时间戳的快照并覆盖 latest，返回时间戳文件路径
    pub fn export(&self, state: &PortfolioState) -> Result<PathBuf> {
        let stamped = self.dir.join(format!(
            "portfolio_{}.json",
            state.taken_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        write_json_atomic(&stamped, state)?;
        write_json_atomic(&self.latest_path(), state)?;
        Ok(stamped)
    }

    /// 周期导出，收到关闭信号后再导出一次并退出
    pub fn spawn_periodic(
        self,
        aggregator: Arc<PortfolioAggregator>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!(
                "📄 组合快照任务启动: 目录 {} 周期 {:?}",
                self.dir.display(),
                period
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.export(&aggregator.snapshot()) {
                            log::error!("❌ 组合快照导出失败: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            match self.export(&aggregator.snapshot()) {
                Ok(path) => log::info!("✅ 组合快照任务退出，最终快照 {}", path.display()),
                Err(e) => log::error!("❌ 最终组合快照导出失败: {}", e),
            }
        })
    }
}
