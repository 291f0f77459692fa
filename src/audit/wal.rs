//! 决策审计日志
//!
//! JSON Lines，只追加。每行 `{seq, prev_hash, hash, record}`，
//! `hash = sha256(prev_hash || record)`，record 为决策记录的 JSON 文本。
//! 重新打开时校验整条链并接着写。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{Result, RouterError};
use crate::core::traits::DecisionSink;
use crate::core::types::DecisionRecord;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// 审计日志中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub record: String,
}

impl AuditEntry {
    pub fn decision(&self) -> Result<DecisionRecord> {
        Ok(serde_json::from_str(&self.record)?)
    }
}

pub fn chain_hash(prev_hash: &str, record: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(record.as_bytes());
    hex::encode(hasher.finalize())
}

/// 按结果统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub by_outcome: BTreeMap<String, usize>,
    pub last_hash: Option<String>,
}

struct WalCursor {
    file: File,
    next_seq: u64,
    last_hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    fsync: bool,
    cursor: Mutex<WalCursor>,
}

impl AuditLog {
    /// 打开或创建审计日志；已有内容的链校验失败时拒绝打开
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existing = Self::replay(&path)?;
        let (next_seq, last_hash) = match existing.last() {
            Some(entry) => (entry.seq + 1, entry.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !existing.is_empty() {
            log::info!(
                "📄 审计日志 {} 已有 {} 条记录，从 seq={} 继续",
                path.display(),
                existing.len(),
                next_seq
            );
        }

        Ok(Self {
            path,
            fsync,
            cursor: Mutex::new(WalCursor {
                file,
                next_seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_record(&self, record: &DecisionRecord) -> Result<AuditEntry> {
        let payload = serde_json::to_string(record)?;
        let mut cursor = self.cursor.lock();

        let entry = AuditEntry {
            seq: cursor.next_seq,
            hash: chain_hash(&cursor.last_hash, &payload),
            prev_hash: cursor.last_hash.clone(),
            record: payload,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        cursor.file.write_all(line.as_bytes())?;
        cursor.file.flush()?;
        if self.fsync {
            cursor.file.sync_data()?;
        }

        cursor.next_seq += 1;
        cursor.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// 读取并校验整条链；文件不存在视为空
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut entries: Vec<AuditEntry> = Vec::new();
        let mut expected_prev = GENESIS_HASH.to_string();

        for (index, line) in reader.lines().enumerate() {
            let line_no = index + 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let corrupted = |reason: String| RouterError::AuditCorrupted {
                line: line_no,
                reason,
            };

            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|e| corrupted(format!("无法解析: {}", e)))?;

            let expected_seq = entries.len() as u64;
            if entry.seq != expected_seq {
                return Err(corrupted(format!(
                    "seq 不连续: 期望 {} 实际 {}",
                    expected_seq, entry.seq
                )));
            }
            if entry.prev_hash != expected_prev {
                return Err(corrupted("prev_hash 与上一行不符".to_string()));
            }
            if chain_hash(&entry.prev_hash, &entry.record) != entry.hash {
                return Err(corrupted("hash 校验失败".to_string()));
            }
            serde_json::from_str::<DecisionRecord>(&entry.record)
                .map_err(|e| corrupted(format!("决策记录格式错误: {}", e)))?;

            expected_prev = entry.hash.clone();
            entries.push(entry);
        }

        Ok(entries)
    }

    pub fn summarize(entries: &[AuditEntry]) -> Result<AuditSummary> {
        let mut summary = AuditSummary::default();
        for entry in entries {
            let record = entry.decision()?;
            *summary
                .by_outcome
                .entry(record.outcome.as_str().to_string())
                .or_insert(0) += 1;
            summary.total += 1;
        }
        summary.last_hash = entries.last().map(|e| e.hash.clone());
        Ok(summary)
    }
}

#[async_trait]
impl DecisionSink for AuditLog {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        self.append_record(record).map(|_| ())
    }
}
