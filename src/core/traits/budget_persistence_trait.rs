use crate::core::error::Result;
use crate::portfolio::PnlTrack;
use crate::risk::RiskBudgetState;

/// 风险预算的持久化后端
///
/// 方法均为阻塞调用，由路由器放到 spawn_blocking 中执行。
/// `save_budget` 只接受 revision 更大的状态，旧写入静默丢弃；
/// 带盈亏样本时，组合盈亏轨迹与键级状态在同一事务内更新，被丢弃的写入不计样本。
pub trait BudgetPersistence: Send + Sync {
    fn load_budgets(&self) -> Result<Vec<RiskBudgetState>>;

    /// 返回是否真正写入
    fn save_budget(&self, state: &RiskBudgetState, pnl_sample: Option<f64>) -> Result<bool>;

    fn load_portfolio_pnl(&self) -> Result<PnlTrack>;
}
