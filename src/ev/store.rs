use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::error::{Result, RouterError};
use crate::core::keyed::KeyedSlots;
use crate::core::traits::EvPersistence;
use crate::core::types::SignalKey;
use crate::utils::atomic_file::write_json_atomic;

use super::profile::EvProfile;

/// 快照中的一条画像及其归档命名空间
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespacedProfile {
    pub namespace: String,
    pub profile: EvProfile,
}

/// EV 画像快照文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvSnapshot {
    pub taken_at: DateTime<Utc>,
    pub profiles: Vec<NamespacedProfile>,
}

impl EvSnapshot {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// EV 状态存储
///
/// 每个键一个缓存槽，槽锁同时串行化该键的读写。
/// 内存中的画像只在持久化成功之后才更新。
pub struct EvStateStore {
    backend: Arc<dyn EvPersistence>,
    slots: KeyedSlots<SignalKey, Option<EvProfile>>,
    namespaces: RwLock<HashMap<String, String>>,
}

impl EvStateStore {
    pub fn new(backend: Arc<dyn EvPersistence>) -> Self {
        Self {
            backend,
            slots: KeyedSlots::new(),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_namespace(&self, strategy_id: &str, namespace: &str) {
        self.namespaces
            .write()
            .insert(strategy_id.to_string(), namespace.to_string());
    }

    /// 未注册的策略使用策略 id 作为命名空间
    pub fn namespace_for(&self, strategy_id: &str) -> String {
        self.namespaces
            .read()
            .get(strategy_id)
            .cloned()
            .unwrap_or_else(|| strategy_id.to_string())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EvPersistence) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(backend.as_ref()))
            .await
            .map_err(|e| RouterError::Persistence(format!("持久化任务异常退出: {}", e)))?
    }

    async fn ensure_loaded(
        &self,
        key: &SignalKey,
        cached: &mut Option<EvProfile>,
    ) -> Result<EvProfile> {
        if let Some(profile) = cached.as_ref() {
            return Ok(profile.clone());
        }

        let namespace = self.namespace_for(&key.strategy_id);
        let lookup = key.clone();
        let loaded = self
            .blocking(move |backend| backend.load(&namespace, &lookup))
            .await?;
        let profile = loaded.unwrap_or_else(|| EvProfile::cold(key.clone()));
        *cached = Some(profile.clone());
        Ok(profile)
    }

    /// 读取画像；从未见过的键返回冷启动画像
    pub async fn get(&self, key: &SignalKey) -> Result<EvProfile> {
        let slot = self.slots.slot(key, || None);
        let mut cached = slot.lock().await;
        self.ensure_loaded(key, &mut cached).await
    }

    /// 计入一笔已实现盈亏。每次成功调用 trade_count 恰好加一。
    pub async fn record_outcome(&self, key: &SignalKey, realized_pnl: f64) -> Result<EvProfile> {
        if !realized_pnl.is_finite() {
            return Err(RouterError::InvalidInput(format!(
                "{} 的已实现盈亏不是有限数: {}",
                key, realized_pnl
            )));
        }

        let slot = self.slots.slot(key, || None);
        let mut cached = slot.lock().await;
        let current = self.ensure_loaded(key, &mut cached).await?;
        let next = current.with_outcome(realized_pnl, Utc::now());

        let namespace = self.namespace_for(&key.strategy_id);
        let to_persist = next.clone();
        if let Err(e) = self
            .blocking(move |backend| backend.persist(&namespace, &to_persist, realized_pnl))
            .await
        {
            log::error!("❌ EV画像持久化失败 {}: {}", key, e);
            return Err(e);
        }

        *cached = Some(next.clone());
        log::debug!(
            "EV画像更新 {}: n={} ev={:.4} var={:.4}",
            key,
            next.trade_count,
            next.expected_value,
            next.variance_estimate
        );
        Ok(next)
    }

    /// 导入种子画像：只写入该策略尚未持久化过的键
    pub async fn import_seed(&self, strategy_id: &str, path: &Path) -> Result<usize> {
        let snapshot = EvSnapshot::read(path)?;
        let namespace = self.namespace_for(strategy_id);
        let mut imported = 0;

        for entry in snapshot.profiles {
            if entry.profile.key.strategy_id != strategy_id {
                continue;
            }
            let key = entry.profile.key.clone();
            let slot = self.slots.slot(&key, || None);
            let mut cached = slot.lock().await;

            let ns = namespace.clone();
            let seed = entry.profile.clone();
            let inserted = self
                .blocking(move |backend| backend.insert_if_absent(&ns, &seed))
                .await?;
            if inserted {
                *cached = Some(entry.profile);
                imported += 1;
            }
        }

        log::info!(
            "📄 策略 {} 从 {} 导入 {} 条种子画像",
            strategy_id,
            path.display(),
            imported
        );
        Ok(imported)
    }

    /// 读取后端中的全部画像
    pub async fn load_all(&self) -> Result<Vec<(String, EvProfile)>> {
        self.blocking(|backend| backend.load_all()).await
    }

    /// 导出全部已持久化画像到 JSON 快照
    pub async fn export_snapshot(&self, path: &Path) -> Result<EvSnapshot> {
        let profiles = self
            .load_all()
            .await?
            .into_iter()
            .map(|(namespace, profile)| NamespacedProfile { namespace, profile })
            .collect();
        let snapshot = EvSnapshot {
            taken_at: Utc::now(),
            profiles,
        };
        write_json_atomic(path, &snapshot)?;
        log::info!(
            "✅ 导出 {} 条EV画像到 {}",
            snapshot.profiles.len(),
            path.display()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ev::memory::MemoryEvPersistence;
    use crate::ev::sqlite::SqliteEvPersistence;

    fn key() -> SignalKey {
        SignalKey::new("s1", "BTCUSDT", "live")
    }

    #[tokio::test]
    async fn test_unknown_key_is_cold() {
        let store = EvStateStore::new(Arc::new(MemoryEvPersistence::new()));
        let profile = store.get(&key()).await.unwrap();
        assert_eq!(profile.trade_count, 0);
        assert_eq!(profile.expected_value, 0.0);
    }

    #[tokio::test]
    async fn test_record_outcome_increments_by_one() {
        let store = EvStateStore::new(Arc::new(MemoryEvPersistence::new()));
        for expected in 1..=5u64 {
            let profile = store.record_outcome(&key(), 1.5).await.unwrap();
            assert_eq!(profile.trade_count, expected);
        }
        assert_eq!(store.get(&key()).await.unwrap().trade_count, 5);
    }

    #[tokio::test]
    async fn test_concurrent_updates_on_same_key_serialize() {
        let backend = Arc::new(MemoryEvPersistence::new());
        let store = Arc::new(EvStateStore::new(backend.clone()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.record_outcome(&key(), i as f64).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let profile = store.get(&key()).await.unwrap();
        assert_eq!(profile.trade_count, 20);
        assert!((profile.expected_value - 9.5).abs() < 1e-9);
        assert_eq!(backend.history_len(), 20);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_profile_unchanged() {
        let backend = Arc::new(MemoryEvPersistence::new());
        let store = EvStateStore::new(backend.clone());
        store.record_outcome(&key(), 2.0).await.unwrap();

        backend.set_fail_writes(true);
        assert!(store.record_outcome(&key(), 2.0).await.is_err());
        assert_eq!(store.get(&key()).await.unwrap().trade_count, 1);

        backend.set_fail_writes(false);
        assert_eq!(store.record_outcome(&key(), 2.0).await.unwrap().trade_count, 2);
    }

    #[tokio::test]
    async fn test_non_finite_pnl_rejected() {
        let store = EvStateStore::new(Arc::new(MemoryEvPersistence::new()));
        let err = store.record_outcome(&key(), f64::NAN).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
        assert_eq!(store.get(&key()).await.unwrap().trade_count, 0);
    }

    #[tokio::test]
    async fn test_restore_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev.db");
        {
            let store = EvStateStore::new(Arc::new(SqliteEvPersistence::open(&path).unwrap()));
            store.register_namespace("s1", "scalp_v1");
            store.record_outcome(&key(), 4.0).await.unwrap();
            store.record_outcome(&key(), 2.0).await.unwrap();
        }

        let store = EvStateStore::new(Arc::new(SqliteEvPersistence::open(&path).unwrap()));
        store.register_namespace("s1", "scalp_v1");
        let profile = store.get(&key()).await.unwrap();
        assert_eq!(profile.trade_count, 2);
        assert!((profile.expected_value - 3.0).abs() < 1e-12);

        // 命名空间不同则互不可见
        let other = EvStateStore::new(Arc::new(SqliteEvPersistence::open(&path).unwrap()));
        assert_eq!(other.get(&key()).await.unwrap().trade_count, 0);
    }

    #[tokio::test]
    async fn test_seed_import_skips_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryEvPersistence::new());
        let store = EvStateStore::new(backend.clone());
        store.record_outcome(&key(), 1.0).await.unwrap();

        let mut warm = EvProfile::cold(SignalKey::new("s1", "ETHUSDT", "live"));
        warm.trade_count = 40;
        warm.expected_value = 1.2;
        let mut existing = EvProfile::cold(key());
        existing.trade_count = 99;
        let foreign = EvProfile::cold(SignalKey::new("s2", "BTCUSDT", "live"));

        let seed_path = dir.path().join("seed.json");
        let snapshot = EvSnapshot {
            taken_at: Utc::now(),
            profiles: vec![warm, existing, foreign]
                .into_iter()
                .map(|profile| NamespacedProfile {
                    namespace: "old".to_string(),
                    profile,
                })
                .collect(),
        };
        write_json_atomic(&seed_path, &snapshot).unwrap();

        assert_eq!(store.import_seed("s1", &seed_path).await.unwrap(), 1);
        let eth = store
            .get(&SignalKey::new("s1", "ETHUSDT", "live"))
            .await
            .unwrap();
        assert_eq!(eth.trade_count, 40);
        assert_eq!(store.get(&key()).await.unwrap().trade_count, 1);
    }

    #[tokio::test]
    async fn test_export_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvStateStore::new(Arc::new(MemoryEvPersistence::new()));
        store.record_outcome(&key(), 1.0).await.unwrap();

        let path = dir.path().join("ev_snapshot.json");
        let exported = store.export_snapshot(&path).await.unwrap();
        assert_eq!(exported.profiles.len(), 1);

        let read_back = EvSnapshot::read(&path).unwrap();
        assert_eq!(read_back.profiles[0].namespace, "s1");
        assert_eq!(read_back.profiles[0].profile.trade_count, 1);
    }
}
