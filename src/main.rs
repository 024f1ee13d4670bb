use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use flowexec::builder::{
    ActionBuilder, DirTemplateStore, FLOW_TOKEN_PLACEHOLDER, FUNGIBLE_TOKEN_PLACEHOLDER, REGISTRY_PLACEHOLDER,
};
use flowexec::config::Config;
use flowexec::events::EventKind;
use flowexec::ledger::{Ledger, LedgerKind};
use flowexec::logging::{info, obj, run_id, v_str, v_u64, warn, Domain};
use flowexec::monitor::EventMonitor;
use flowexec::orchestrator::analytics::{AnalyticsSink, NullSink, WebhookSink};
use flowexec::orchestrator::{execution_channel, Orchestrator};
use flowexec::scheduler::Scheduler;
use flowexec::storage::ExecutionStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;
    cfg.log_config();

    let kind = LedgerKind::for_config_flag(cfg.dry_run);
    let ledger: Arc<dyn Ledger> = Arc::from(kind.build(&cfg)?);
    info(
        Domain::System,
        "ledger",
        obj(&[
            ("type", v_str(if cfg.dry_run { "paper" } else { "rest" })),
            ("access_node", v_str(&cfg.access_node)),
        ]),
    );

    let scheduler = Scheduler::new();
    let (listener, exec_rx) = execution_channel();
    scheduler.add_listener(listener);

    let analytics: Arc<dyn AnalyticsSink> = match &cfg.analytics_webhook {
        Some(url) => Arc::new(WebhookSink::new(url)),
        None => Arc::new(NullSink),
    };
    let builder = ActionBuilder::new(Arc::new(DirTemplateStore::new(&cfg.templates_dir)), &cfg.vault_address)
        .with_alias(REGISTRY_PLACEHOLDER, &cfg.registry_address)
        .with_alias(FUNGIBLE_TOKEN_PLACEHOLDER, cfg.network.fungible_token_address())
        .with_alias(FLOW_TOKEN_PLACEHOLDER, cfg.network.flow_token_address());
    let mut orchestrator = Orchestrator::new(ledger.clone(), builder, scheduler.clone(), analytics, cfg.policy());
    if let Some(path) = &cfg.sqlite_path {
        let mut store = ExecutionStore::new(path)?;
        store.init()?;
        orchestrator = orchestrator.with_journal(store);
    }
    let orchestrator = Arc::new(orchestrator);

    let monitor = EventMonitor::new(ledger.clone(), cfg.monitor());
    let subscription = monitor.subscribe(&EventKind::ALL);
    monitor.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_orchestrator = orchestrator.clone();
    let run_shutdown = shutdown_rx.clone();
    let runner = tokio::spawn(async move {
        run_orchestrator.run(subscription, exec_rx, run_shutdown).await;
    });

    // Periodic removal of settled schedules.
    let cleanup_scheduler = scheduler.clone();
    let mut cleanup_shutdown = shutdown_rx.clone();
    let retention = Duration::from_secs(cfg.schedule_retention_secs);
    let every = Duration::from_secs(cfg.cleanup_interval_secs.max(1));
    let cleaner = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cleanup_shutdown.changed() => break,
                _ = ticker.tick() => {
                    cleanup_scheduler.cleanup(retention);
                }
            }
        }
    });

    info(
        Domain::System,
        "started",
        obj(&[
            ("run_id", v_str(&run_id())),
            ("network", v_str(cfg.network.as_str())),
            ("cursor", v_u64(monitor.cursor())),
        ]),
    );

    wait_for_signal().await;
    info(Domain::System, "shutdown_requested", obj(&[]));

    monitor.stop();
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    let _ = cleaner.await;

    let stats = scheduler.get_stats();
    if stats.pending > 0 {
        warn(
            Domain::Scheduler,
            "pending_dropped_on_exit",
            obj(&[("pending", v_u64(stats.pending))]),
        );
    }
    info(
        Domain::System,
        "stopped",
        obj(&[
            ("total_events", v_u64(monitor.total_events())),
            ("schedules_total", v_u64(stats.total)),
            ("schedules_completed", v_u64(stats.completed)),
            ("schedules_failed", v_u64(stats.failed)),
        ]),
    );
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
