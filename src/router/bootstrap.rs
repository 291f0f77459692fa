use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::core::config::RouterConfig;
use crate::core::error::Result;
use crate::ev::{EvStateStore, SqliteEvPersistence};
use crate::manifest::ManifestRegistry;
use crate::portfolio::{PortfolioAggregator, SnapshotExporter};
use crate::risk::SqliteBudgetPersistence;

use super::decision::{DecisionRouter, RouterSettings};

/// 按配置装配好的运行时
pub struct RouterRuntime {
    pub config: RouterConfig,
    pub registry: Arc<ManifestRegistry>,
    pub ev_store: Arc<EvStateStore>,
    pub portfolio: Arc<PortfolioAggregator>,
    pub audit: Arc<AuditLog>,
    pub router: Arc<DecisionRouter>,
}

impl RouterRuntime {
    /// 加载清单、打开存储、导入种子画像，恢复风险预算后创建路由器
    pub async fn build(config: RouterConfig) -> Result<Self> {
        let registry = Arc::new(ManifestRegistry::load(&config.manifest_paths[..])?);
        log::info!("✅ 已加载 {} 份策略清单: {:?}", registry.len(), registry.ids());

        let backend = Arc::new(SqliteEvPersistence::open(&config.storage.ev_db_path)?);
        let ev_store = Arc::new(EvStateStore::new(backend));
        for manifest in registry.iter() {
            ev_store.register_namespace(&manifest.id, &manifest.archive_namespace());
        }
        for manifest in registry.iter() {
            if let Some(seed) = &manifest.state.ev_profile_seed {
                let seed_path = resolve_relative(&manifest.source, seed);
                ev_store.import_seed(&manifest.id, &seed_path).await?;
            }
        }

        let audit = Arc::new(AuditLog::open(
            &config.storage.audit_log_path,
            config.storage.audit_fsync,
        )?);
        let budget_store = Arc::new(SqliteBudgetPersistence::open(&config.storage.ev_db_path)?);
        let portfolio = Arc::new(PortfolioAggregator::new(&config.portfolio));
        let router = Arc::new(DecisionRouter::new(
            registry.clone(),
            ev_store.clone(),
            portfolio.clone(),
            audit.clone(),
            budget_store,
            RouterSettings::from_config(&config),
        ));
        router.restore_budgets().await?;

        Ok(Self {
            config,
            registry,
            ev_store,
            portfolio,
            audit,
            router,
        })
    }

    pub fn snapshot_exporter(&self) -> SnapshotExporter {
        SnapshotExporter::new(&self.config.storage.snapshot_dir)
    }

    /// 周期为 0 时不启动
    pub fn spawn_snapshot_task(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let secs = self.config.storage.snapshot_interval_secs;
        if secs == 0 {
            return None;
        }
        Some(self.snapshot_exporter().spawn_periodic(
            self.portfolio.clone(),
            Duration::from_secs(secs),
            shutdown,
        ))
    }
}

// 相对路径按清单文件所在目录解析
fn resolve_relative(manifest_source: &Path, target: &str) -> PathBuf {
    let target = PathBuf::from(target);
    if target.is_absolute() {
        return target;
    }
    match manifest_source.parent() {
        Some(dir) => dir.join(target),
        None => target,
    }
}
