//! End-to-end executor flows over the paper ledger: recommendation gating,
//! scheduled hand-offs through the run loop, analytics forwarding and the
//! execution journal.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use flowexec::builder::{ActionBuilder, MemoryTemplateStore, RebalanceRequest};
use flowexec::events::{Contract, EventKind, EventSource, MonitorEvent};
use flowexec::ledger::{Finality, PaperLedger, TxStatus, VaultStats};
use flowexec::monitor::{EventMonitor, MonitorConfig};
use flowexec::orchestrator::analytics::RecordingSink;
use flowexec::orchestrator::policy::PolicyConfig;
use flowexec::orchestrator::{execution_channel, EventOutcome, Orchestrator};
use flowexec::scheduler::{ScheduleStatus, Scheduler};
use flowexec::storage::ExecutionStore;

const VAULT: &str = "0xf8d6e0586b0a20c7";
const REBALANCE_CDC: &str = "import AIONVault from 0xAIONVAULT\n\
transaction(fromStrategy: String, toStrategy: String, amount: UFix64, reason: String) {}";

fn builder() -> ActionBuilder {
    let store = MemoryTemplateStore::new().with("rebalance.cdc", REBALANCE_CDC);
    ActionBuilder::new(Arc::new(store), VAULT)
}

fn policy() -> PolicyConfig {
    PolicyConfig { auto_execute: true, ..PolicyConfig::default() }
}

fn funded_ledger(total_assets: f64) -> Arc<PaperLedger> {
    let ledger = Arc::new(PaperLedger::new(1));
    ledger.set_vault_stats(VaultStats { total_assets, total_shares: total_assets });
    ledger
}

fn recommendation_payload(confidence: f64) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("aiAgent".to_string(), json!("0x179b6b1cb6755e31"));
    payload.insert("recommendedStrategies".to_string(), json!(["staking", "lending"]));
    payload.insert("riskScore".to_string(), json!("20.00000000"));
    payload.insert("confidence".to_string(), json!(format!("{:.8}", confidence)));
    payload
}

fn recommendation(confidence: f64) -> MonitorEvent {
    let mut payload = recommendation_payload(confidence);
    payload.insert("transactionId".to_string(), json!("tx-rec"));
    MonitorEvent { kind: EventKind::StrategyRecommendation, payload }
}

#[tokio::test]
async fn confidence_threshold_is_inclusive() {
    let ledger = funded_ledger(100.0);
    let orch = Orchestrator::new(ledger.clone(), builder(), Scheduler::new(), Arc::new(RecordingSink::new()), policy());

    assert_eq!(
        orch.handle_event(&recommendation(79.0)).await,
        EventOutcome::Skipped("below_threshold".to_string())
    );
    assert!(ledger.submissions().is_empty());

    match orch.handle_event(&recommendation(80.0)).await {
        EventOutcome::Submitted(r) => {
            assert!(r.success);
            assert_eq!(r.tx_id.as_deref(), Some("paper_tx_1"));
            assert_eq!(r.status, Some(TxStatus::Sealed));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let subs = ledger.submissions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].args()[0].value, json!("current"));
    assert_eq!(subs[0].args()[1].value, json!("staking"));
    assert_eq!(subs[0].args()[2].value, json!("50.00000000"));
    assert!(subs[0].code().contains(VAULT));
}

#[tokio::test]
async fn auto_execute_off_only_observes() {
    let ledger = funded_ledger(100.0);
    let orch = Orchestrator::new(
        ledger.clone(),
        builder(),
        Scheduler::new(),
        Arc::new(RecordingSink::new()),
        PolicyConfig::default(),
    );
    assert_eq!(
        orch.handle_event(&recommendation(99.0)).await,
        EventOutcome::Skipped("auto_execute_disabled".to_string())
    );
    assert!(ledger.submissions().is_empty());
}

#[tokio::test]
async fn empty_vault_still_rebalances_at_threshold() {
    let ledger = funded_ledger(0.0);
    let orch = Orchestrator::new(ledger.clone(), builder(), Scheduler::new(), Arc::new(RecordingSink::new()), policy());
    match orch.handle_event(&recommendation(80.0)).await {
        EventOutcome::Submitted(r) => assert!(r.success),
        other => panic!("unexpected outcome {:?}", other),
    }
    let subs = ledger.submissions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].args()[2].value, json!("0.00000000"));
}

#[tokio::test]
async fn unreadable_vault_stats_count_as_empty() {
    let ledger = Arc::new(PaperLedger::new(1));
    ledger.fail_vault_stats();
    let orch = Orchestrator::new(ledger.clone(), builder(), Scheduler::new(), Arc::new(RecordingSink::new()), policy());
    assert!(matches!(orch.handle_event(&recommendation(90.0)).await, EventOutcome::Submitted(_)));
    let subs = ledger.submissions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].args()[2].value, json!("0.00000000"));
}

#[tokio::test]
async fn unsuccessful_finality_is_a_failed_execution() {
    let ledger = funded_ledger(10.0);
    ledger.set_finality(
        "paper_tx_1",
        Finality { status: TxStatus::Expired, error_message: None, raw: json!({}) },
    );
    ledger.set_finality(
        "paper_tx_2",
        Finality {
            status: TxStatus::Sealed,
            error_message: Some("[Error Code: 1101] panic: vault locked".to_string()),
            raw: json!({}),
        },
    );
    let orch = Orchestrator::new(ledger.clone(), builder(), Scheduler::new(), Arc::new(RecordingSink::new()), policy());
    let env = orch
        .builder()
        .rebalance(&RebalanceRequest {
            from_strategy: "current".to_string(),
            to_strategy: "lending".to_string(),
            amount: 2.5,
            reason: "manual".to_string(),
        })
        .unwrap();

    let expired = orch.execute_action(&env).await;
    assert!(!expired.success);
    assert_eq!(expired.status, Some(TxStatus::Expired));
    assert!(expired.error.is_some());

    let reverted = orch.execute_action(&env).await;
    assert!(!reverted.success);
    assert_eq!(reverted.status, Some(TxStatus::Sealed));
    assert_eq!(reverted.error.as_deref(), Some("[Error Code: 1101] panic: vault locked"));
    assert_eq!(reverted.fingerprint, env.fingerprint());
}

#[tokio::test]
async fn vault_activity_is_forwarded_to_analytics() {
    let sink = Arc::new(RecordingSink::new());
    let orch = Orchestrator::new(funded_ledger(1.0), builder(), Scheduler::new(), sink.clone(), policy());

    let mut payload = Map::new();
    payload.insert("user".to_string(), json!("0x01"));
    payload.insert("amount".to_string(), json!("5.00000000"));
    payload.insert("transactionId".to_string(), json!("tx-dep"));
    let outcome = orch.handle_event(&MonitorEvent { kind: EventKind::Deposit, payload }).await;
    assert!(matches!(outcome, EventOutcome::Forwarded(_)));

    let snapshot = MonitorEvent { kind: EventKind::VaultSnapshot, payload: Map::new() };
    assert_eq!(orch.handle_event(&snapshot).await, EventOutcome::Logged);

    sleep(Duration::from_millis(50)).await;
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, "deposit");
    assert_eq!(records[0].data["amount"], json!("5.00000000"));
    assert_eq!(records[0].data["transactionId"], json!("tx-dep"));
}

#[tokio::test(start_paused = true)]
async fn scheduled_recommendation_runs_through_the_loop() {
    let ledger = funded_ledger(100.0);
    let scheduler = Scheduler::new();
    let (listener, exec_rx) = execution_channel();
    scheduler.add_listener(listener);
    let policy = PolicyConfig { use_scheduled_tx: true, execution_delay_secs: 300, ..policy() };
    let orch = Arc::new(Orchestrator::new(
        ledger.clone(),
        builder(),
        scheduler.clone(),
        Arc::new(RecordingSink::new()),
        policy,
    ));

    let monitor = EventMonitor::new(
        ledger.clone(),
        MonitorConfig {
            poll_interval_ms: 1000,
            start_height: Some(0),
            sources: vec![EventSource::new(Contract::AionVault, VAULT)],
        },
    );
    let subscription = monitor.subscribe(&EventKind::ALL);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(subscription, exec_rx, shutdown_rx).await })
    };

    let source = EventSource::new(Contract::AionVault, VAULT);
    ledger.push_event(&source, EventKind::StrategyRecommendation, "tx-rec", 0, 1, recommendation_payload(90.0));
    monitor.poll_once().await.unwrap();

    sleep(Duration::from_secs(1)).await;
    let pending = scheduler.get_pending_schedules();
    assert_eq!(pending.len(), 1);
    assert!(ledger.submissions().is_empty());

    sleep(Duration::from_secs(300)).await;
    let sched = scheduler.get_schedule(&pending[0].id).unwrap();
    assert_eq!(sched.status, ScheduleStatus::Completed);
    let subs = ledger.submissions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].args()[2].value, json!("50.00000000"));

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
}

#[tokio::test]
async fn executions_are_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");
    let path = path.to_str().unwrap();
    let mut store = ExecutionStore::new(path).unwrap();
    store.init().unwrap();

    let ledger = funded_ledger(40.0);
    let orch = Orchestrator::new(ledger.clone(), builder(), Scheduler::new(), Arc::new(RecordingSink::new()), policy())
        .with_journal(store);
    let first = match orch.handle_event(&recommendation(90.0)).await {
        EventOutcome::Submitted(r) => r,
        other => panic!("unexpected outcome {:?}", other),
    };
    ledger.fail_submissions("relay returned 502");
    orch.handle_event(&recommendation(90.0)).await;

    let reader = ExecutionStore::new(path).unwrap();
    let recent = reader.recent(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert!(!recent[0].success);
    assert_eq!(recent[0].error.as_deref(), Some("relay returned 502"));
    assert!(recent[1].success);
    assert_eq!(recent[1].origin, "immediate");
    assert_eq!(recent[1].tx_id.as_deref(), Some("paper_tx_1"));
    assert_eq!(reader.attempts_for(&first.fingerprint).unwrap(), 2);
}
