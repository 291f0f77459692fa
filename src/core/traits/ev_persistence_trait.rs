use crate::core::error::Result;
use crate::core::types::SignalKey;
use crate::ev::profile::EvProfile;

/// EV 画像的持久化后端
///
/// 方法均为阻塞调用，由 EvStateStore 放到 spawn_blocking 中执行。
/// `persist` 必须是原子的：要么画像与历史记录同时落盘，要么都不落盘。
pub trait EvPersistence: Send + Sync {
    fn load(&self, namespace: &str, key: &SignalKey) -> Result<Option<EvProfile>>;

    /// 返回 (namespace, profile) 列表
    fn load_all(&self) -> Result<Vec<(String, EvProfile)>>;

    fn persist(&self, namespace: &str, profile: &EvProfile, realized_pnl: f64) -> Result<()>;

    /// 导入种子画像，仅在该键尚无记录时写入；返回是否写入
    fn insert_if_absent(&self, namespace: &str, profile: &EvProfile) -> Result<bool>;
}
