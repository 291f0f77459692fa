//! 分片的按键互斥表
//!
//! 每个键拥有独立的 tokio Mutex（公平、先到先得），不同键之间互不阻塞；
//! 分片上的 RwLock 只在查找/插入槽位时短暂持有，从不跨 await。

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_SHARDS: usize = 16;

pub struct KeyedSlots<K, V> {
    shards: Vec<RwLock<HashMap<K, Arc<Mutex<V>>>>>,
}

impl<K, V> KeyedSlots<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, Arc<Mutex<V>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// 获取键对应的槽位，不存在时用 init 创建
    pub fn slot(&self, key: &K, init: impl FnOnce() -> V) -> Arc<Mutex<V>> {
        let shard = self.shard(key);
        if let Some(slot) = shard.read().get(key) {
            return slot.clone();
        }
        shard
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.shard(key).read().get(key).cloned()
    }

    /// 当前所有槽位的拷贝，用于全量校验
    pub fn entries(&self) -> Vec<(K, Arc<Mutex<V>>)> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for KeyedSlots<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
