// 工具模块 - 原子写文件与日志
pub mod atomic_file;
pub mod unified_logger;

pub use atomic_file::write_json_atomic;
pub use unified_logger::{init_global_logger, LogConfig, DECISION_TARGET};
