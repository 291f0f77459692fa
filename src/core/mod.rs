// 核心模块 - 类型、错误、配置与并发原语
pub mod config;
pub mod error;
pub mod keyed;
pub mod reasons;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use keyed::KeyedSlots;
pub use types::{
    Band, Category, DecisionOutcome, DecisionRecord, Signal, SignalKey, TradeOutcome,
};
