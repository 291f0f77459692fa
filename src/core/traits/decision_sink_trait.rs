use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::{Result, RouterError};
use crate::core::types::DecisionRecord;

/// 决策记录落地接口，每个信号恰好调用一次 append
#[async_trait]
pub trait DecisionSink: Send + Sync {
    /// 追加一条决策记录，返回前必须已写入（不可丢弃）
    async fn append(&self, record: &DecisionRecord) -> Result<()>;
}

/// 内存实现，供测试与回放使用
#[derive(Default)]
pub struct MemoryDecisionSink {
    records: Mutex<Vec<DecisionRecord>>,
    fail_appends: AtomicBool,
}

impl MemoryDecisionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入写失败
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl DecisionSink for MemoryDecisionSink {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(RouterError::Persistence("注入的审计写入失败".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
