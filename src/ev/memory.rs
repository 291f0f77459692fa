use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::error::{Result, RouterError};
use crate::core::traits::EvPersistence;
use crate::core::types::SignalKey;

use super::profile::EvProfile;

/// 内存持久化，用于测试与无盘运行；可注入写失败与读写延迟
#[derive(Default)]
pub struct MemoryEvPersistence {
    profiles: Mutex<HashMap<(String, SignalKey), EvProfile>>,
    history: Mutex<Vec<(String, SignalKey, f64)>>,
    fail_writes: AtomicBool,
    load_delay_ms: AtomicU64,
    persist_delay_ms: AtomicU64,
}

impl MemoryEvPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_persist_delay(&self, delay: Duration) {
        self.persist_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

impl EvPersistence for MemoryEvPersistence {
    fn load(&self, namespace: &str, key: &SignalKey) -> Result<Option<EvProfile>> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(self
            .profiles
            .lock()
            .get(&(namespace.to_string(), key.clone()))
            .cloned())
    }

    fn load_all(&self) -> Result<Vec<(String, EvProfile)>> {
        let mut all: Vec<(String, EvProfile)> = self
            .profiles
            .lock()
            .iter()
            .map(|((ns, _), p)| (ns.clone(), p.clone()))
            .collect();
        all.sort_by(|a, b| (&a.0, &a.1.key).cmp(&(&b.0, &b.1.key)));
        Ok(all)
    }

    fn persist(&self, namespace: &str, profile: &EvProfile, realized_pnl: f64) -> Result<()> {
        let delay = self.persist_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RouterError::Persistence("注入的写入失败".to_string()));
        }
        let mut profiles = self.profiles.lock();
        let slot = (namespace.to_string(), profile.key.clone());
        let keep_existing = profiles
            .get(&slot)
            .map_or(false, |existing| existing.trade_count > profile.trade_count);
        if !keep_existing {
            profiles.insert(slot, profile.clone());
        }
        self.history
            .lock()
            .push((namespace.to_string(), profile.key.clone(), realized_pnl));
        Ok(())
    }

    fn insert_if_absent(&self, namespace: &str, profile: &EvProfile) -> Result<bool> {
        let mut profiles = self.profiles.lock();
        let slot = (namespace.to_string(), profile.key.clone());
        if profiles.contains_key(&slot) {
            return Ok(false);
        }
        profiles.insert(slot, profile.clone());
        Ok(true)
    }
}
