//! 决策路由器
//!
//! 每个信号按固定顺序经过：清单查找 → 时效 → 输入校验 → 准入门(可被 EV 绕行覆盖)
//! → 风险预算 → 组合上限 → 预算落盘 → 放行，并恰好产生一条审计记录。
//! 同一键的信号在键锁内按到达顺序处理，不同键并发。

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RouterConfig;
use crate::core::error::{Result, RouterError};
use crate::core::keyed::KeyedSlots;
use crate::core::reasons;
use crate::core::traits::{BudgetPersistence, DecisionSink};
use crate::core::types::{DecisionOutcome, DecisionRecord, Signal, SignalKey, TradeOutcome};
use crate::ev::{BypassVerdict, EvBypassPolicy, EvStateStore};
use crate::gate::{self, GateVerdict};
use crate::manifest::ManifestRegistry;
use crate::portfolio::{PortfolioAggregator, PortfolioDelta};
use crate::risk::{
    advance_reservation_ids, ReleasedPosition, RiskBudgetEnforcer, RiskBudgetState, RiskVerdict,
};
use crate::utils::unified_logger::DECISION_TARGET;

/// 路由器运行参数
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_signal_age: chrono::Duration,
    pub persistence_timeout: Duration,
    pub bypass: EvBypassPolicy,
}

impl RouterSettings {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            max_signal_age: config.max_signal_age(),
            persistence_timeout: config.persistence_timeout(),
            bypass: EvBypassPolicy::new(&config.ev_bypass),
        }
    }
}

/// 组合一致性校验结果
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub mismatches: Vec<String>,
}

pub struct DecisionRouter {
    registry: Arc<ManifestRegistry>,
    ev_store: Arc<EvStateStore>,
    portfolio: Arc<PortfolioAggregator>,
    sink: Arc<dyn DecisionSink>,
    budget_store: Arc<dyn BudgetPersistence>,
    enforcer: RiskBudgetEnforcer,
    budgets: KeyedSlots<SignalKey, RiskBudgetState>,
    settings: RouterSettings,
    halted: AtomicBool,
}

impl DecisionRouter {
    pub fn new(
        registry: Arc<ManifestRegistry>,
        ev_store: Arc<EvStateStore>,
        portfolio: Arc<PortfolioAggregator>,
        sink: Arc<dyn DecisionSink>,
        budget_store: Arc<dyn BudgetPersistence>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            ev_store,
            portfolio,
            sink,
            budget_store,
            enforcer: RiskBudgetEnforcer::new(),
            budgets: KeyedSlots::new(),
            settings,
            halted: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ManifestRegistry> {
        &self.registry
    }

    pub fn ev_store(&self) -> &Arc<EvStateStore> {
        &self.ev_store
    }

    pub fn portfolio(&self) -> &Arc<PortfolioAggregator> {
        &self.portfolio
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn halt(&self, cause: &RouterError) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            log::error!("🚨 风控账目异常，路由器停止放行: {}", cause);
        }
    }

    fn timeout_error(&self, operation: String) -> RouterError {
        RouterError::PersistenceTimeout {
            operation,
            timeout_ms: self.settings.persistence_timeout.as_millis() as u64,
        }
    }

    /// 在持久化时限内写入键级预算；超时后写入可能稍后落地，由 revision 丢弃
    async fn persist_budget(
        &self,
        state: &RiskBudgetState,
        pnl_sample: Option<f64>,
    ) -> Result<()> {
        let store = Arc::clone(&self.budget_store);
        let snapshot = state.clone();
        let write = tokio::task::spawn_blocking(move || store.save_budget(&snapshot, pnl_sample));
        match tokio::time::timeout(self.settings.persistence_timeout, write).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(RouterError::Persistence(format!(
                "风险预算持久化任务异常退出: {}",
                e
            ))),
            Err(_) => Err(self.timeout_error(format!("budget_save {}", state.key))),
        }
    }

    /// 启动时恢复全部键级预算，并据此重建组合敞口与盈亏轨迹
    ///
    /// 必须在处理任何信号之前调用。
    pub async fn restore_budgets(&self) -> Result<usize> {
        let store = Arc::clone(&self.budget_store);
        let (budgets, pnl) = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((store.load_budgets()?, store.load_portfolio_pnl()?))
        })
        .await
        .map_err(|e| RouterError::Persistence(format!("风险预算恢复任务异常退出: {}", e)))??;

        let restored = budgets.len();
        let mut open = Vec::new();
        let mut last_id = 0;
        for state in budgets {
            last_id = last_id.max(state.last_reservation_id().unwrap_or(0));
            match self.registry.get(&state.key.strategy_id) {
                Some(manifest) => {
                    open.push((state.key.clone(), manifest.category, state.open_notional));
                }
                None if state.concurrent_open > 0 => log::warn!(
                    "⚠️ {} 有 {} 笔未平仓预留，但策略已不在清单中，敞口不计入组合",
                    state.key,
                    state.concurrent_open
                ),
                None => {}
            }
            let key = state.key.clone();
            let slot = self.budgets.slot(&key, || RiskBudgetState::new(key.clone()));
            *slot.lock().await = state;
        }

        advance_reservation_ids(last_id);
        self.portfolio.restore(open, pnl);
        log::info!(
            "✅ 恢复 {} 个键的风险预算，组合回撤 {:.2}",
            restored,
            pnl.drawdown
        );
        Ok(restored)
    }

    /// 处理一个信号，返回已写入审计日志的决策记录
    ///
    /// 在拿到键锁之前不能有 await，否则同键信号的到达顺序无法保证。
    pub async fn route(&self, signal: Signal) -> Result<DecisionRecord> {
        if self.is_halted() {
            return self
                .finish(&signal, DecisionOutcome::RiskBlock, vec![reasons::ROUTER_HALTED])
                .await;
        }

        let manifest =
            match self
                .registry
                .lookup(&signal.strategy_id, &signal.instrument, &signal.mode)
            {
                Ok(manifest) => manifest,
                Err(miss) => {
                    log::warn!(
                        "⚠️ 丢弃信号 {}: {}",
                        signal.signal_ref(),
                        miss.into_error(&signal.strategy_id, &signal.instrument, &signal.mode)
                    );
                    return self
                        .finish(&signal, DecisionOutcome::PortfolioBlock, vec![miss.reason()])
                        .await;
                }
            };

        let now = Utc::now();
        if signal.is_stale(now, self.settings.max_signal_age) {
            log::warn!(
                "⚠️ {}",
                RouterError::StaleSignal {
                    signal_ref: signal.signal_ref(),
                    age_ms: signal.age_ms(now),
                }
            );
            return self
                .finish(&signal, DecisionOutcome::GateBlock, vec![reasons::STALE_SIGNAL])
                .await;
        }

        if !signal.has_finite_inputs() {
            log::warn!(
                "⚠️ 信号 {} 含非有限数: size={} spread={} rv={}",
                signal.signal_ref(),
                signal.proposed_size,
                signal.spread,
                signal.realized_vol
            );
            return self
                .finish(&signal, DecisionOutcome::RiskBlock, vec![reasons::INVALID_SIGNAL])
                .await;
        }

        let key = signal.key();
        let slot = self
            .budgets
            .slot(&key, || RiskBudgetState::new(key.clone()));
        let mut state = slot.lock().await;

        // 排队期间可能已被其他信号触发停机
        if self.is_halted() {
            return self
                .finish(&signal, DecisionOutcome::RiskBlock, vec![reasons::ROUTER_HALTED])
                .await;
        }

        let mut chain: Vec<&'static str> = Vec::new();
        let mut bypassed = false;

        if let GateVerdict::Fail(gate_reason) = gate::evaluate(&signal, &manifest) {
            chain.push(gate_reason);

            let profile = match tokio::time::timeout(
                self.settings.persistence_timeout,
                self.ev_store.get(&key),
            )
            .await
            {
                Ok(Ok(profile)) => profile,
                Ok(Err(e)) => {
                    log::error!("❌ 读取EV画像失败 {}: {}", key, e);
                    chain.push(reasons::PERSISTENCE_TIMEOUT);
                    return self.finish(&signal, DecisionOutcome::RiskBlock, chain).await;
                }
                Err(_) => {
                    log::warn!("⚠️ {}", self.timeout_error(format!("ev_get {}", key)));
                    chain.push(reasons::PERSISTENCE_TIMEOUT);
                    return self.finish(&signal, DecisionOutcome::RiskBlock, chain).await;
                }
            };

            match self
                .settings
                .bypass
                .evaluate(&profile, manifest.risk.warmup_trades)
            {
                BypassVerdict::Bypass => {
                    bypassed = true;
                    chain.push(reasons::EV_BYPASS);
                    log::debug!(
                        "EV绕行 {}: n={} ev={:.4} var={:.4}",
                        key,
                        profile.trade_count,
                        profile.expected_value,
                        profile.variance_estimate
                    );
                }
                BypassVerdict::Deny(deny_reason) => {
                    chain.push(deny_reason);
                    return self.finish(&signal, DecisionOutcome::GateBlock, chain).await;
                }
            }
        }

        let reservation = match self
            .enforcer
            .check_and_reserve(&signal, &manifest, &mut state)
        {
            RiskVerdict::Reserved(reservation) => reservation,
            RiskVerdict::Block(risk_reason) => {
                chain.push(risk_reason);
                return self.finish(&signal, DecisionOutcome::RiskBlock, chain).await;
            }
        };

        if let Err(portfolio_reason) =
            self.portfolio
                .try_admit(&key, manifest.category, reservation.notional)
        {
            self.enforcer.rollback(&mut state, reservation.id);
            chain.push(portfolio_reason);
            return self
                .finish(&signal, DecisionOutcome::PortfolioBlock, chain)
                .await;
        }

        let undo_portfolio = PortfolioDelta {
            key: key.clone(),
            category: manifest.category,
            notional_delta: -reservation.notional,
            drawdown_sample: None,
        };

        // 预留落盘之前不放行，否则重启后平仓回报找不到预留
        if let Err(e) = self.persist_budget(&state, None).await {
            self.enforcer.rollback(&mut state, reservation.id);
            self.portfolio.apply_delta(undo_portfolio);
            log::error!("❌ 风险预算持久化失败，拒绝放行 {}: {}", key, e);
            // 超时的写入可能稍后落地，用更新的 revision 覆盖
            if let Err(persist_err) = self.persist_budget(&state, None).await {
                log::warn!("⚠️ 撤销后的风险预算未能落盘 {}: {}", key, persist_err);
            }
            chain.push(reasons::PERSISTENCE_TIMEOUT);
            return self.finish(&signal, DecisionOutcome::RiskBlock, chain).await;
        }

        let outcome = if bypassed {
            DecisionOutcome::EvBypass
        } else {
            DecisionOutcome::Admit
        };
        let mut record = DecisionRecord::new(&signal, outcome, to_strings(&chain));
        record.reservation_id = Some(reservation.id);

        if let Err(e) = self.sink.append(&record).await {
            // 没有审计记录的放行不能生效
            self.enforcer.rollback(&mut state, reservation.id);
            self.portfolio.apply_delta(undo_portfolio);
            log::error!("❌ 审计写入失败，撤销放行 {}: {}", record.signal_ref, e);
            if let Err(persist_err) = self.persist_budget(&state, None).await {
                log::error!(
                    "🚨 撤销后的风险预算未能落盘 {}，重启后将残留预留 #{}: {}",
                    key,
                    reservation.id,
                    persist_err
                );
            }
            return Err(e);
        }

        log::info!(
            target: DECISION_TARGET,
            "{} {} #{} {:.2} {}",
            record.signal_ref,
            key,
            reservation.id,
            reservation.notional,
            record.reason_chain()
        );
        Ok(record)
    }

    async fn finish(
        &self,
        signal: &Signal,
        outcome: DecisionOutcome,
        chain: Vec<&'static str>,
    ) -> Result<DecisionRecord> {
        let record = DecisionRecord::new(signal, outcome, to_strings(&chain));
        self.sink.append(&record).await?;
        log::info!(
            target: DECISION_TARGET,
            "{} {} {}",
            record.signal_ref,
            record.key(),
            record.reason_chain()
        );
        Ok(record)
    }

    /// 并发处理一批信号，结果与输入一一对应
    pub async fn process_batch(&self, signals: Vec<Signal>) -> Vec<Result<DecisionRecord>> {
        join_all(signals.into_iter().map(|signal| self.route(signal))).await
    }

    /// 平仓回报：释放预留、更新组合、计入 EV，全程持有键锁
    ///
    /// 释放先落盘再生效；落盘失败时什么都没有改变，可以整体重试。
    /// EV 写入失败或超时时预留已经释放，调用方只需重试 `ev_store().record_outcome`。
    pub async fn on_trade_outcome(&self, outcome: &TradeOutcome) -> Result<ReleasedPosition> {
        if !outcome.realized_pnl.is_finite() {
            return Err(RouterError::InvalidInput(format!(
                "{} 的已实现盈亏不是有限数: {}",
                outcome.key(),
                outcome.realized_pnl
            )));
        }

        let key = outcome.key();
        let manifest = self
            .registry
            .get(&outcome.strategy_id)
            .cloned()
            .ok_or_else(|| RouterError::NotFound {
                strategy_id: outcome.strategy_id.clone(),
                instrument: outcome.instrument.clone(),
                mode: outcome.mode.clone(),
            })?;

        let Some(slot) = self.budgets.get(&key) else {
            let err = RouterError::ReservationLeak {
                key: key.to_string(),
                detail: "该键从未预留过".to_string(),
            };
            self.halt(&err);
            return Err(err);
        };
        let mut state = slot.lock().await;

        let mut next = state.clone();
        let released = match self
            .enforcer
            .release(&mut next, outcome.reservation_id, outcome.realized_pnl)
        {
            Ok(released) => released,
            Err(e) => {
                self.halt(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.persist_budget(&next, Some(outcome.realized_pnl)).await {
            log::error!("❌ 平仓释放未能落盘 {} #{}: {}", key, released.id, e);
            return Err(e);
        }
        *state = next;

        self.portfolio.apply_delta(PortfolioDelta {
            key: key.clone(),
            category: manifest.category,
            notional_delta: -released.notional,
            drawdown_sample: Some(outcome.realized_pnl),
        });

        let profile = match tokio::time::timeout(
            self.settings.persistence_timeout,
            self.ev_store.record_outcome(&key, outcome.realized_pnl),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                let err = self.timeout_error(format!("ev_record_outcome {}", key));
                log::error!("❌ 预留 #{} 已释放，EV 未计入: {}", released.id, err);
                return Err(err);
            }
        };

        log::info!(
            "✅ 平仓 {} #{} 盈亏 {:.2} 回撤 {:.2} EV n={} ev={:.4}",
            key,
            released.id,
            released.realized_pnl,
            released.drawdown_after,
            profile.trade_count,
            profile.expected_value
        );
        Ok(released)
    }

    /// 人工复位某个键的回撤与盈亏统计，落盘后才生效
    pub async fn reset_budget(&self, key: &SignalKey) -> Result<bool> {
        let Some(slot) = self.budgets.get(key) else {
            return Ok(false);
        };
        let mut state = slot.lock().await;
        let mut next = state.clone();
        self.enforcer.reset(&mut next);
        self.persist_budget(&next, None).await?;
        *state = next;
        Ok(true)
    }

    pub async fn budget_state(&self, key: &SignalKey) -> Option<RiskBudgetState> {
        let slot = self.budgets.get(key)?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    /// 用各键的未平仓预留重算类别敞口，与组合视图比对
    ///
    /// 只在没有并发路由时结果才有意义。
    pub async fn verify_portfolio_consistency(&self) -> ConsistencyReport {
        let mut open = Vec::new();
        for (key, slot) in self.budgets.entries() {
            let state = slot.lock().await;
            if let Some(manifest) = self.registry.get(&key.strategy_id) {
                open.push((manifest.category, state.open_notional));
            }
        }

        let expected = PortfolioAggregator::recompute(open);
        let snapshot = self.portfolio.snapshot();
        let mut mismatches = Vec::new();
        for (category, want) in &expected {
            let got = snapshot
                .category_exposure
                .get(category)
                .copied()
                .unwrap_or(0.0);
            if (got - want).abs() > 1e-6 {
                mismatches.push(format!("{}: 视图 {:.6} 重算 {:.6}", category, got, want));
            }
        }

        if !mismatches.is_empty() {
            log::error!("🚨 组合敞口与风险预算不一致: {}", mismatches.join("; "));
        }
        ConsistencyReport {
            consistent: mismatches.is_empty(),
            mismatches,
        }
    }
}

fn to_strings(chain: &[&'static str]) -> Vec<String> {
    chain.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::{EvPersistence, MemoryDecisionSink};
    use crate::core::types::Category;
    use crate::ev::{EvProfile, MemoryEvPersistence};
    use crate::risk::MemoryBudgetPersistence;
    use crate::manifest::model::tests::SAMPLE;
    use crate::manifest::StrategyManifest;

    struct Harness {
        router: Arc<DecisionRouter>,
        sink: Arc<MemoryDecisionSink>,
        backend: Arc<MemoryEvPersistence>,
        budgets: Arc<MemoryBudgetPersistence>,
    }

    fn harness_with(manifest_yaml: &str, config: RouterConfig) -> Harness {
        let manifest = StrategyManifest::from_yaml_str(manifest_yaml, "sample.yml").unwrap();
        let registry = Arc::new(ManifestRegistry::from_manifests(vec![manifest]).unwrap());
        let backend = Arc::new(MemoryEvPersistence::new());
        let ev_store = Arc::new(EvStateStore::new(backend.clone()));
        ev_store.register_namespace("scalp_btc", "scalp_v1");
        let portfolio = Arc::new(PortfolioAggregator::new(&config.portfolio));
        let sink = Arc::new(MemoryDecisionSink::new());
        let budgets = Arc::new(MemoryBudgetPersistence::new());
        let router = Arc::new(DecisionRouter::new(
            registry,
            ev_store,
            portfolio,
            sink.clone(),
            budgets.clone(),
            RouterSettings::from_config(&config),
        ));
        Harness {
            router,
            sink,
            backend,
            budgets,
        }
    }

    fn harness() -> Harness {
        harness_with(SAMPLE, RouterConfig::default())
    }

    fn signal(id: &str, size: f64) -> Signal {
        Signal {
            id: Some(id.to_string()),
            strategy_id: "scalp_btc".to_string(),
            instrument: "BTCUSDT".to_string(),
            mode: "live".to_string(),
            session: "asia".to_string(),
            spread: 1.0,
            realized_vol: 0.5,
            latency_ms: 20,
            timestamp: Utc::now(),
            proposed_size: size,
        }
    }

    fn key() -> SignalKey {
        SignalKey::new("scalp_btc", "BTCUSDT", "live")
    }

    fn outcome(pnl: f64) -> TradeOutcome {
        TradeOutcome {
            strategy_id: "scalp_btc".to_string(),
            instrument: "BTCUSDT".to_string(),
            mode: "live".to_string(),
            realized_pnl: pnl,
            reservation_id: None,
            timestamp: Utc::now(),
        }
    }

    fn seed_profile(backend: &MemoryEvPersistence, trade_count: u64, ev: f64, variance: f64) {
        let mut profile = EvProfile::cold(key());
        profile.trade_count = trade_count;
        profile.expected_value = ev;
        profile.variance_estimate = variance;
        assert!(backend.insert_if_absent("scalp_v1", &profile).unwrap());
    }

    #[tokio::test]
    async fn test_clean_signal_admits() {
        let h = harness();
        let record = h.router.route(signal("a", 1_000.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::Admit);
        assert!(record.reasons.is_empty());
        assert!(record.reservation_id.is_some());
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 1_000.0);
    }

    #[tokio::test]
    async fn test_second_signal_hits_max_concurrent() {
        let yaml = SAMPLE.replace("max_concurrent: 2", "max_concurrent: 1");
        let h = harness_with(&yaml, RouterConfig::default());

        let first = h.router.route(signal("a", 100.0)).await.unwrap();
        let second = h.router.route(signal("b", 100.0)).await.unwrap();
        assert_eq!(first.outcome, DecisionOutcome::Admit);
        assert_eq!(second.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(second.reasons, vec![reasons::MAX_CONCURRENT_EXCEEDED]);
    }

    #[tokio::test]
    async fn test_scalping_cap_blocks_and_rolls_back_reservation() {
        let h = harness();
        h.router
            .portfolio()
            .try_admit(
                &SignalKey::new("other", "ETHUSDT", "live"),
                Category::Scalping,
                95_000.0,
            )
            .unwrap();

        let record = h.router.route(signal("a", 10_000.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::PortfolioBlock);
        assert_eq!(record.reasons, vec![reasons::CATEGORY_CAP_EXCEEDED]);

        let state = h.router.budget_state(&key()).await.unwrap();
        assert_eq!(state.concurrent_open, 0);
        assert_eq!(state.open_notional, 0.0);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 95_000.0);
    }

    #[tokio::test]
    async fn test_warm_profile_bypasses_gate_failure() {
        let h = harness();
        seed_profile(&h.backend, 50, 2.0, 4.0);

        let mut wide = signal("a", 500.0);
        wide.spread = 3.0;
        let record = h.router.route(wide).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::EvBypass);
        assert_eq!(
            record.reasons,
            vec![reasons::SPREAD_OUT_OF_BAND, reasons::EV_BYPASS]
        );
        assert_eq!(h.router.budget_state(&key()).await.unwrap().concurrent_open, 1);
    }

    #[tokio::test]
    async fn test_cold_profile_cannot_bypass() {
        let h = harness();
        let mut wide = signal("a", 500.0);
        wide.spread = 3.0;
        let record = h.router.route(wide).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::GateBlock);
        assert_eq!(
            record.reasons,
            vec![reasons::SPREAD_OUT_OF_BAND, reasons::EV_WARMUP_INCOMPLETE]
        );
        assert_eq!(h.router.budget_state(&key()).await.unwrap().concurrent_open, 0);
    }

    #[tokio::test]
    async fn test_bypassed_signal_still_checked_by_risk() {
        let yaml = SAMPLE.replace("max_concurrent: 2", "max_concurrent: 1");
        let h = harness_with(&yaml, RouterConfig::default());
        seed_profile(&h.backend, 50, 2.0, 4.0);
        h.router.route(signal("a", 100.0)).await.unwrap();

        let mut late = signal("b", 100.0);
        late.latency_ms = 999;
        let record = h.router.route(late).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(
            record.reasons,
            vec![
                reasons::LATENCY_CAP_EXCEEDED,
                reasons::EV_BYPASS,
                reasons::MAX_CONCURRENT_EXCEEDED
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_signal_has_no_side_effects() {
        let h = harness();
        seed_profile(&h.backend, 50, 2.0, 4.0);
        let mut old = signal("a", 100.0);
        old.timestamp = Utc::now() - chrono::Duration::seconds(30);

        let record = h.router.route(old).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::GateBlock);
        assert_eq!(record.reasons, vec![reasons::STALE_SIGNAL]);
        assert!(h.router.budget_state(&key()).await.is_none());
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
    }

    #[tokio::test]
    async fn test_unknown_strategy_and_instrument() {
        let h = harness();
        let mut unknown = signal("a", 100.0);
        unknown.strategy_id = "ghost".to_string();
        let record = h.router.route(unknown).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::PortfolioBlock);
        assert_eq!(record.reasons, vec![reasons::UNKNOWN_STRATEGY]);

        let mut paper = signal("b", 100.0);
        paper.mode = "paper".to_string();
        let record = h.router.route(paper).await.unwrap();
        assert_eq!(record.reasons, vec![reasons::UNKNOWN_INSTRUMENT]);
        assert_eq!(h.sink.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_ev_read_fails_safe() {
        let mut config = RouterConfig::default();
        config.persistence_timeout_ms = 30;
        let h = harness_with(SAMPLE, config);
        h.backend.set_load_delay(Duration::from_millis(300));

        let mut wide = signal("a", 100.0);
        wide.spread = 3.0;
        let record = h.router.route(wide).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(
            record.reasons,
            vec![reasons::SPREAD_OUT_OF_BAND, reasons::PERSISTENCE_TIMEOUT]
        );
    }

    #[tokio::test]
    async fn test_reserve_then_release_restores_budget() {
        let h = harness();
        h.router.route(signal("a", 1_234.5)).await.unwrap();

        let released = h.router.on_trade_outcome(&outcome(12.5)).await.unwrap();
        assert_eq!(released.notional, 1_234.5);

        let state = h.router.budget_state(&key()).await.unwrap();
        assert_eq!(state.open_notional, 0.0);
        assert_eq!(state.concurrent_open, 0);
        assert_eq!(state.trade_count_since_warmup, 1);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
        assert_eq!(h.router.ev_store().get(&key()).await.unwrap().trade_count, 1);
    }

    #[tokio::test]
    async fn test_each_outcome_adds_exactly_one_trade() {
        let h = harness();
        for (i, pnl) in [5.0, -2.0, 3.0].iter().enumerate() {
            h.router
                .route(signal(&format!("s{}", i), 100.0))
                .await
                .unwrap();
            h.router.on_trade_outcome(&outcome(*pnl)).await.unwrap();
            let profile = h.router.ev_store().get(&key()).await.unwrap();
            assert_eq!(profile.trade_count, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_release_without_reserve_halts_router() {
        let h = harness();
        let err = h.router.on_trade_outcome(&outcome(1.0)).await.unwrap_err();
        assert!(matches!(err, RouterError::ReservationLeak { .. }));
        assert!(err.is_fatal());
        assert!(h.router.is_halted());

        let record = h.router.route(signal("a", 100.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(record.reasons, vec![reasons::ROUTER_HALTED]);
        assert_eq!(h.router.ev_store().get(&key()).await.unwrap().trade_count, 0);
    }

    #[tokio::test]
    async fn test_batch_keeps_same_key_order_and_one_record_each() {
        let h = harness();
        let mut signals: Vec<Signal> = (0..3).map(|i| signal(&format!("k{}", i), 100.0)).collect();
        let mut eth = signal("eth", 100.0);
        eth.instrument = "ETHUSDT".to_string();
        signals.push(eth);
        let mut ghost = signal("ghost", 100.0);
        ghost.strategy_id = "ghost".to_string();
        signals.push(ghost);

        let results = h.router.process_batch(signals).await;
        let outcomes: Vec<DecisionOutcome> =
            results.iter().map(|r| r.as_ref().unwrap().outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                DecisionOutcome::Admit,
                DecisionOutcome::Admit,
                DecisionOutcome::RiskBlock,
                DecisionOutcome::Admit,
                DecisionOutcome::PortfolioBlock,
            ]
        );
        assert_eq!(h.sink.len(), 5);
        assert!(h.router.verify_portfolio_consistency().await.consistent);
    }

    #[tokio::test]
    async fn test_concurrent_keys_keep_exposure_consistent() {
        let h = harness();
        let mut handles = Vec::new();
        for i in 0..40 {
            let router = Arc::clone(&h.router);
            handles.push(tokio::spawn(async move {
                let mut s = signal(&format!("c{}", i), 250.0);
                if i % 2 == 0 {
                    s.instrument = "ETHUSDT".to_string();
                    s.mode = format!("m{}", i % 4);
                }
                router.route(s).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(h.sink.len(), 40);
        let report = h.router.verify_portfolio_consistency().await;
        assert!(report.consistent, "{:?}", report.mismatches);
    }

    #[tokio::test]
    async fn test_audit_failure_rolls_back_admission() {
        let h = harness();
        h.sink.set_fail_appends(true);
        assert!(h.router.route(signal("a", 100.0)).await.is_err());

        let state = h.router.budget_state(&key()).await.unwrap();
        assert_eq!(state.concurrent_open, 0);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
    }

    #[tokio::test]
    async fn test_drawdown_breach_blocks_until_reset() {
        let h = harness();
        h.router.route(signal("a", 100.0)).await.unwrap();
        h.router.on_trade_outcome(&outcome(-1_500.0)).await.unwrap();

        let record = h.router.route(signal("b", 100.0)).await.unwrap();
        assert_eq!(record.reasons, vec![reasons::MAX_DRAWDOWN_BREACHED]);

        assert!(h.router.reset_budget(&key()).await.unwrap());
        assert_eq!(h.budgets.stored(&key()).unwrap().current_drawdown, 0.0);
        let record = h.router.route(signal("c", 100.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::Admit);
    }

    #[tokio::test]
    async fn test_non_finite_signal_is_blocked_without_side_effects() {
        let h = harness();
        let record = h.router.route(signal("nan", f64::NAN)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(record.reasons, vec![reasons::INVALID_SIGNAL]);

        let mut bad_vol = signal("inf", 100.0);
        bad_vol.realized_vol = f64::INFINITY;
        let record = h.router.route(bad_vol).await.unwrap();
        assert_eq!(record.reasons, vec![reasons::INVALID_SIGNAL]);
        assert!(h.router.budget_state(&key()).await.is_none());

        // 上限依旧有效
        let record = h.router.route(signal("huge", 1e12)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(record.reasons, vec![reasons::MAX_NOTIONAL_EXCEEDED]);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
        assert_eq!(h.sink.len(), 3);
    }

    #[tokio::test]
    async fn test_far_future_timestamp_is_stale() {
        let h = harness();
        let mut future = signal("f", 100.0);
        future.timestamp = Utc::now() + chrono::Duration::hours(1);
        let record = h.router.route(future).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::GateBlock);
        assert_eq!(record.reasons, vec![reasons::STALE_SIGNAL]);
        assert!(h.router.budget_state(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_drawdown_blocks_at_portfolio_stage() {
        let mut config = RouterConfig::default();
        config.portfolio.max_aggregate_drawdown = 1_000.0;
        let h = harness_with(SAMPLE, config);

        let mut eth = signal("eth", 100.0);
        eth.instrument = "ETHUSDT".to_string();
        assert!(h.router.route(signal("btc", 100.0)).await.unwrap().outcome.is_admitted());
        assert!(h.router.route(eth).await.unwrap().outcome.is_admitted());

        let mut eth_outcome = outcome(-600.0);
        eth_outcome.instrument = "ETHUSDT".to_string();
        h.router.on_trade_outcome(&outcome(-600.0)).await.unwrap();
        h.router.on_trade_outcome(&eth_outcome).await.unwrap();
        // 单键回撤 600 未触及 1000，组合回撤 1200 已超限
        assert_eq!(h.router.portfolio().snapshot().aggregate_drawdown, 1_200.0);

        let record = h.router.route(signal("next", 100.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::PortfolioBlock);
        assert_eq!(
            record.reasons.last().map(String::as_str),
            Some(reasons::AGGREGATE_DRAWDOWN_EXCEEDED)
        );
        assert!(record.reservation_id.is_none());

        let state = h.router.budget_state(&key()).await.unwrap();
        assert_eq!(state.concurrent_open, 0);
        assert_eq!(state.open_notional, 0.0);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
    }

    #[tokio::test]
    async fn test_slow_ev_write_does_not_hold_key_lock() {
        let mut config = RouterConfig::default();
        config.persistence_timeout_ms = 30;
        let h = harness_with(SAMPLE, config);
        h.router.route(signal("a", 100.0)).await.unwrap();
        h.backend.set_persist_delay(Duration::from_millis(400));

        let started = std::time::Instant::now();
        let err = h.router.on_trade_outcome(&outcome(3.0)).await.unwrap_err();
        assert!(matches!(err, RouterError::PersistenceTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(300));

        // 预留已释放，同键信号无需等待 EV 写入
        let record = tokio::time::timeout(
            Duration::from_millis(200),
            h.router.route(signal("b", 100.0)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.outcome, DecisionOutcome::Admit);
        assert_eq!(h.router.budget_state(&key()).await.unwrap().concurrent_open, 1);
    }

    #[tokio::test]
    async fn test_budget_write_failure_blocks_admission() {
        let h = harness();
        h.budgets.set_fail_writes(true);

        let record = h.router.route(signal("a", 100.0)).await.unwrap();
        assert_eq!(record.outcome, DecisionOutcome::RiskBlock);
        assert_eq!(record.reasons, vec![reasons::PERSISTENCE_TIMEOUT]);
        assert_eq!(h.router.budget_state(&key()).await.unwrap().concurrent_open, 0);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 0.0);
        assert!(h.budgets.stored(&key()).is_none());
    }

    #[tokio::test]
    async fn test_release_is_persisted_before_it_applies() {
        let h = harness();
        let admitted = h.router.route(signal("a", 100.0)).await.unwrap();
        let stored = h.budgets.stored(&key()).unwrap();
        assert_eq!(stored.concurrent_open, 1);

        h.budgets.set_fail_writes(true);
        assert!(h.router.on_trade_outcome(&outcome(-50.0)).await.is_err());
        assert!(!h.router.is_halted());
        let state = h.router.budget_state(&key()).await.unwrap();
        assert_eq!(state.concurrent_open, 1);
        assert_eq!(state.cumulative_pnl, 0.0);
        assert_eq!(h.router.portfolio().exposure(Category::Scalping), 100.0);
        assert_eq!(h.router.ev_store().get(&key()).await.unwrap().trade_count, 0);

        h.budgets.set_fail_writes(false);
        let released = h.router.on_trade_outcome(&outcome(-50.0)).await.unwrap();
        assert_eq!(Some(released.id), admitted.reservation_id);
        let stored = h.budgets.stored(&key()).unwrap();
        assert_eq!(stored.concurrent_open, 0);
        assert_eq!(stored.current_drawdown, 50.0);
    }
}
