use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use signal_router::{
    audit::AuditLog,
    core::config::RouterConfig,
    core::types::{DecisionOutcome, Signal, TradeOutcome},
    ev::{EvStateStore, SqliteEvPersistence},
    manifest::ManifestRegistry,
    router::RouterRuntime,
    utils::unified_logger::init_global_logger,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

fn cli() -> Command {
    Command::new("signal-router")
        .version(env!("CARGO_PKG_VERSION"))
        .about("策略信号准入与路由")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("路由器配置文件路径")
                .default_value("config/router.yaml")
                .global(true),
        )
        .subcommand(Command::new("validate").about("加载并校验全部策略清单"))
        .subcommand(
            Command::new("route")
                .about("处理信号文件(JSON Lines)，可选地回放平仓结果")
                .arg(
                    Arg::new("signals")
                        .short('s')
                        .long("signals")
                        .value_name("FILE")
                        .help("信号文件，每行一个 Signal")
                        .required(true),
                )
                .arg(
                    Arg::new("outcomes")
                        .short('o')
                        .long("outcomes")
                        .value_name("FILE")
                        .help("平仓结果文件，每行一个 TradeOutcome"),
                )
                .arg(
                    Arg::new("concurrent")
                        .long("concurrent")
                        .action(ArgAction::SetTrue)
                        .help("并发处理全部信号（同键仍按顺序）"),
                ),
        )
        .subcommand(
            Command::new("ev-snapshot").about("导出EV画像快照").arg(
                Arg::new("out")
                    .long("out")
                    .value_name("FILE")
                    .help("输出文件")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("audit-replay")
                .about("校验审计日志哈希链并按结果统计")
                .arg(
                    Arg::new("path")
                        .long("path")
                        .value_name("FILE")
                        .help("审计日志路径，缺省取配置中的 audit_log_path"),
                ),
        )
}

fn load_config(path: &str) -> anyhow::Result<RouterConfig> {
    if Path::new(path).exists() {
        RouterConfig::from_file(path).with_context(|| format!("加载配置失败: {}", path))
    } else {
        Ok(RouterConfig::default())
    }
}

/// 返回解析成功的条目与无法解析的行数，后者计入失败
fn read_jsonl<T: DeserializeOwned>(path: &str) -> anyhow::Result<(Vec<T>, usize)> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("读取文件失败: {}", path))?;
    let mut items = Vec::new();
    let mut rejected = 0usize;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                rejected += 1;
                log::error!("❌ {} 第{}行无法解析，未生成决策记录: {}", path, index + 1, e);
            }
        }
    }
    Ok((items, rejected))
}

async fn run_route(config: RouterConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let signals_path = args
        .get_one::<String>("signals")
        .ok_or_else(|| anyhow!("缺少 --signals"))?;
    let (signals, rejected): (Vec<Signal>, usize) = read_jsonl(signals_path)?;
    log::info!("📄 读取 {} 个信号: {}", signals.len(), signals_path);

    let runtime = RouterRuntime::build(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let snapshot_task = runtime.spawn_snapshot_task(shutdown_rx);

    let results = if args.get_flag("concurrent") {
        runtime.router.process_batch(signals).await
    } else {
        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            results.push(runtime.router.route(signal).await);
        }
        results
    };

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut failures = rejected;
    for result in &results {
        match result {
            Ok(record) => *counts.entry(record.outcome.as_str()).or_insert(0) += 1,
            Err(e) => {
                failures += 1;
                log::error!("❌ 信号处理失败: {}", e);
            }
        }
    }

    if let Some(outcomes_path) = args.get_one::<String>("outcomes") {
        let (outcomes, rejected): (Vec<TradeOutcome>, usize) = read_jsonl(outcomes_path)?;
        failures += rejected;
        for outcome in &outcomes {
            if let Err(e) = runtime.router.on_trade_outcome(outcome).await {
                failures += 1;
                log::error!("❌ 平仓结果处理失败 {}: {}", outcome.key(), e);
                if e.is_fatal() {
                    break;
                }
            }
        }
    }

    let report = runtime.router.verify_portfolio_consistency().await;
    let latest = runtime.snapshot_exporter().export(&runtime.portfolio.snapshot())?;
    let _ = shutdown_tx.send(true);
    if let Some(task) = snapshot_task {
        task.await?;
    }

    for outcome in [
        DecisionOutcome::Admit,
        DecisionOutcome::EvBypass,
        DecisionOutcome::GateBlock,
        DecisionOutcome::RiskBlock,
        DecisionOutcome::PortfolioBlock,
    ] {
        println!(
            "{:<16} {}",
            outcome.as_str(),
            counts.get(outcome.as_str()).copied().unwrap_or(0)
        );
    }
    println!("{:<16} {}", "failed", failures);
    println!("组合快照: {}", latest.display());

    if runtime.router.is_halted() {
        return Err(anyhow!("路由器因风控账目异常已停止放行"));
    }
    if !report.consistent {
        return Err(anyhow!("组合敞口不一致: {}", report.mismatches.join("; ")));
    }
    if failures > 0 {
        return Err(anyhow!("{} 条输入未能处理", failures));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "config/router.yaml".to_string());
    let config = load_config(&config_path)?;

    let _log_handle =
        init_global_logger(&config.log).map_err(|e| anyhow!("日志系统初始化失败: {}", e))?;
    log::info!("启动路由器，配置文件: {}", config_path);

    match matches.subcommand() {
        Some(("validate", _)) => {
            let registry = ManifestRegistry::load(&config.manifest_paths[..])?;
            for id in registry.ids() {
                if let Some(manifest) = registry.get(&id) {
                    println!(
                        "{} [{}] v{} 品种 {} 命名空间 {}",
                        manifest.id,
                        manifest.category,
                        manifest.version,
                        manifest.instruments.len(),
                        manifest.archive_namespace()
                    );
                }
            }
            log::info!("✅ {} 份策略清单校验通过", registry.len());
        }
        Some(("route", args)) => run_route(config, args).await?,
        Some(("ev-snapshot", args)) => {
            let out = args
                .get_one::<String>("out")
                .ok_or_else(|| anyhow!("缺少 --out"))?;
            let registry = ManifestRegistry::load(&config.manifest_paths[..])?;
            let backend = Arc::new(SqliteEvPersistence::open(&config.storage.ev_db_path)?);
            let store = EvStateStore::new(backend);
            for manifest in registry.iter() {
                store.register_namespace(&manifest.id, &manifest.archive_namespace());
            }
            let snapshot = store.export_snapshot(Path::new(out)).await?;
            println!("导出 {} 条EV画像到 {}", snapshot.profiles.len(), out);
        }
        Some(("audit-replay", args)) => {
            let path = args
                .get_one::<String>("path")
                .cloned()
                .unwrap_or_else(|| config.storage.audit_log_path.clone());
            let entries = AuditLog::replay(&path)?;
            let summary = AuditLog::summarize(&entries)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            log::info!("✅ 审计日志 {} 哈希链完整，共 {} 条", path, summary.total);
        }
        _ => return Err(anyhow!("未知子命令")),
    }

    Ok(())
}
