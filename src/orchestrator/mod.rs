//! Policy and glue between the monitor, the builder, the scheduler and the
//! ledger.
//!
//! The orchestrator owns the only submission path. Events from the monitor
//! and envelopes handed off by the scheduler are consumed by a single `run`
//! loop, so submissions made by the executor never interleave.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::builder::{ActionBuilder, ActionEnvelope, RebalanceRequest};
use crate::events::{EventKind, MonitorEvent};
use crate::ledger::{Ledger, TxStatus, VaultStats};
use crate::logging::{
    debug, error, info, log_decision, log_submission, obj, ts_epoch_ms, v_num, v_str, v_u64, warn, Domain,
};
use crate::monitor::Subscription;
use crate::reliability::circuit::{CircuitBreaker, CircuitState};
use crate::scheduler::{ExecuteListener, ScheduleId, Scheduler};
use crate::storage::{ExecutionRecord, ExecutionStore};

pub mod analytics;
pub mod policy;

use analytics::{forward, AnalyticsRecord, AnalyticsSink, AnalyticsType};
use policy::{format_confidence, rebalance_amount, Gate, PolicyConfig};

/// Outcome of one submission. Transport and ledger failures are reported
/// here rather than as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub tx_id: Option<String>,
    pub status: Option<TxStatus>,
    pub error: Option<String>,
    pub fingerprint: String,
    pub name: String,
}

/// What handling an event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Submitted(ExecutionResult),
    Scheduled(ScheduleId),
    Skipped(String),
    Forwarded(AnalyticsType),
    Logged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Immediate,
    Scheduled,
    Manual,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Immediate => "immediate",
            Origin::Scheduled => "scheduled",
            Origin::Manual => "manual",
        }
    }
}

/// An envelope whose schedule fired.
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub schedule_id: ScheduleId,
    pub envelope: ActionEnvelope,
}

/// Scheduler listener that hands envelopes to the `run` loop.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ScheduledExecution>,
}

impl ExecuteListener for ChannelListener {
    fn on_execute(&self, schedule_id: &str, envelope: &ActionEnvelope) -> Result<()> {
        self.tx
            .send(ScheduledExecution {
                schedule_id: schedule_id.to_string(),
                envelope: envelope.clone(),
            })
            .map_err(|_| anyhow!("executor loop is not running"))
    }
}

pub fn execution_channel() -> (Arc<ChannelListener>, mpsc::UnboundedReceiver<ScheduledExecution>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), rx)
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    builder: ActionBuilder,
    scheduler: Scheduler,
    analytics: Arc<dyn AnalyticsSink>,
    policy: PolicyConfig,
    circuit: Mutex<CircuitBreaker>,
    journal: Option<Mutex<ExecutionStore>>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        builder: ActionBuilder,
        scheduler: Scheduler,
        analytics: Arc<dyn AnalyticsSink>,
        policy: PolicyConfig,
    ) -> Self {
        let circuit = Mutex::new(CircuitBreaker::new(policy.emergency_pause_threshold));
        Self {
            ledger,
            builder,
            scheduler,
            analytics,
            policy,
            circuit,
            journal: None,
        }
    }

    pub fn with_journal(mut self, store: ExecutionStore) -> Self {
        self.journal = Some(Mutex::new(store));
        self
    }

    pub fn builder(&self) -> &ActionBuilder {
        &self.builder
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn circuit_state(&self) -> CircuitState {
        locked(&self.circuit).state
    }

    pub async fn handle_event(&self, event: &MonitorEvent) -> EventOutcome {
        match event.kind {
            EventKind::StrategyRecommendation => self.handle_recommendation(event).await,
            EventKind::Rebalance => self.forward(AnalyticsType::Rebalance, event),
            EventKind::Deposit => self.forward(AnalyticsType::Deposit, event),
            EventKind::Withdraw => self.forward(AnalyticsType::Withdraw, event),
            EventKind::ActionExecuted => self.forward(AnalyticsType::ActionExecuted, event),
            EventKind::YieldRealized
            | EventKind::StrategyAllocationUpdated
            | EventKind::AiAgentUpdated
            | EventKind::VaultLockStatusChanged
            | EventKind::VaultSnapshot
            | EventKind::ActionRegistered
            | EventKind::ActionFailed
            | EventKind::ActionUpdated => {
                debug(
                    Domain::Policy,
                    "event_observed",
                    obj(&[
                        ("event_kind", v_str(event.kind.as_str())),
                        ("tx_id", v_str(event.tx_id().unwrap_or(""))),
                    ]),
                );
                EventOutcome::Logged
            }
        }
    }

    fn forward(&self, kind: AnalyticsType, event: &MonitorEvent) -> EventOutcome {
        info(
            Domain::Policy,
            "event_forwarded",
            obj(&[
                ("event_kind", v_str(event.kind.as_str())),
                ("tx_id", v_str(event.tx_id().unwrap_or(""))),
            ]),
        );
        forward(self.analytics.clone(), AnalyticsRecord::new(kind, event.payload.clone()));
        EventOutcome::Forwarded(kind)
    }

    /// Acts on an AI strategy recommendation when policy allows it.
    pub async fn handle_recommendation(&self, event: &MonitorEvent) -> EventOutcome {
        let confidence = event.f64_field("confidence");
        let mut strategies = event.string_list("recommendedStrategies");
        if strategies.is_empty() {
            strategies = event.string_list("strategies");
        }
        info(
            Domain::Policy,
            "recommendation_received",
            obj(&[
                ("tx_id", v_str(event.tx_id().unwrap_or(""))),
                ("agent", v_str(event.str_field("aiAgent").unwrap_or(""))),
                ("strategies", v_str(&strategies.join(","))),
                ("confidence", confidence.map(v_num).unwrap_or(serde_json::Value::Null)),
                ("risk_score", event.f64_field("riskScore").map(v_num).unwrap_or(serde_json::Value::Null)),
            ]),
        );

        let gate = self.policy.gate(confidence, self.circuit_state() == CircuitState::Closed);
        let shown = confidence.unwrap_or(0.0);
        if gate != Gate::Proceed {
            log_decision("StrategyRecommendation", "skip", gate.reason(), shown, self.policy.min_confidence);
            return EventOutcome::Skipped(gate.reason().to_string());
        }
        let target = match strategies.first() {
            Some(s) => s.clone(),
            None => {
                log_decision("StrategyRecommendation", "skip", "no_strategies", shown, self.policy.min_confidence);
                return EventOutcome::Skipped("no_strategies".to_string());
            }
        };

        let amount = match self.rebalance_amount().await {
            Ok(a) => a,
            Err(e) => {
                error(Domain::Policy, "amount_invalid", obj(&[("error", v_str(&e.to_string()))]));
                return EventOutcome::Skipped("amount_invalid".to_string());
            }
        };

        let request = RebalanceRequest {
            from_strategy: "current".to_string(),
            to_strategy: target,
            amount,
            reason: format!("AI Recommendation (confidence: {}%)", format_confidence(shown)),
        };
        let envelope = match self.builder.rebalance(&request) {
            Ok(env) => env,
            Err(e) => {
                error(Domain::Policy, "build_failed", obj(&[("error", v_str(&e.to_string()))]));
                return EventOutcome::Skipped("build_failed".to_string());
            }
        };
        log_decision("StrategyRecommendation", "execute", gate.reason(), shown, self.policy.min_confidence);

        if self.policy.use_scheduled_tx {
            EventOutcome::Scheduled(self.scheduler.schedule_action(envelope, self.policy.execution_delay_secs))
        } else {
            EventOutcome::Submitted(self.execute_with_origin(&envelope, Origin::Immediate).await)
        }
    }

    /// An unreadable vault summary counts as an empty vault.
    async fn rebalance_amount(&self) -> Result<f64> {
        let stats = match self.ledger.vault_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn(Domain::Policy, "vault_stats_unavailable", obj(&[("error", v_str(&e.to_string()))]));
                VaultStats::default()
            }
        };
        let formatted = rebalance_amount(stats.total_assets, self.policy.rebalance_percentage)?;
        debug(
            Domain::Policy,
            "rebalance_amount",
            obj(&[
                ("total_assets", v_num(stats.total_assets)),
                ("percentage", v_num(self.policy.rebalance_percentage)),
                ("amount", v_str(&formatted)),
            ]),
        );
        Ok(formatted.parse()?)
    }

    /// Submits an envelope outside the automatic path. A success here also
    /// lifts an emergency pause.
    pub async fn execute_action(&self, envelope: &ActionEnvelope) -> ExecutionResult {
        self.execute_with_origin(envelope, Origin::Manual).await
    }

    async fn execute_with_origin(&self, envelope: &ActionEnvelope, origin: Origin) -> ExecutionResult {
        let fingerprint = envelope.fingerprint();
        info(
            Domain::Exec,
            "submitting",
            obj(&[
                ("action", v_str(envelope.name())),
                ("fingerprint", v_str(&fingerprint)),
                ("origin", v_str(origin.as_str())),
            ]),
        );

        let mut result = ExecutionResult {
            success: false,
            tx_id: None,
            status: None,
            error: None,
            fingerprint,
            name: envelope.name().to_string(),
        };
        match self.ledger.submit(envelope).await {
            Err(e) => result.error = Some(e.to_string()),
            Ok(tx_id) => {
                result.tx_id = Some(tx_id.clone());
                match self.ledger.await_finality(&tx_id).await {
                    Ok(finality) => {
                        result.success = finality.succeeded();
                        result.status = Some(finality.status);
                        if !result.success {
                            result.error = Some(
                                finality
                                    .error_message
                                    .unwrap_or_else(|| format!("transaction ended {}", finality.status.as_str())),
                            );
                        }
                    }
                    Err(e) => result.error = Some(e.to_string()),
                }
            }
        }

        self.record_outcome(envelope, &result, origin);
        result
    }

    fn record_outcome(&self, envelope: &ActionEnvelope, result: &ExecutionResult, origin: Origin) {
        let status = result.status.map(|s| s.as_str()).unwrap_or("none");
        log_submission(&result.name, &result.fingerprint, result.tx_id.as_deref(), status, result.success);
        if let Some(err) = &result.error {
            warn(
                Domain::Exec,
                "submission_failed",
                obj(&[("action", v_str(&result.name)), ("error", v_str(err))]),
            );
        }

        let opened = {
            let mut circuit = locked(&self.circuit);
            if result.success {
                circuit.record_success();
                None
            } else if circuit.record_failure() {
                Some(circuit.failures)
            } else {
                None
            }
        };
        if let Some(failures) = opened {
            error(
                Domain::Exec,
                "emergency_pause_engaged",
                obj(&[
                    ("consecutive_failures", v_u64(failures as u64)),
                    ("threshold", v_u64(self.policy.emergency_pause_threshold as u64)),
                ]),
            );
        }

        if let Some(journal) = &self.journal {
            let rec = ExecutionRecord {
                ts_ms: ts_epoch_ms(),
                name: result.name.clone(),
                action_type: envelope.action_type().as_str().to_string(),
                fingerprint: result.fingerprint.clone(),
                tx_id: result.tx_id.clone(),
                status: result.status.map(|s| s.as_str().to_string()),
                success: result.success,
                error: result.error.clone(),
                origin: origin.as_str().to_string(),
            };
            if let Err(e) = locked(journal).record(&rec) {
                warn(Domain::Exec, "journal_write_failed", obj(&[("error", v_str(&e.to_string()))]));
            }
        }
    }

    /// Submits an envelope whose schedule fired. Skipped while paused.
    pub async fn handle_scheduled(&self, job: ScheduledExecution) -> Option<ExecutionResult> {
        if self.circuit_state() == CircuitState::Open {
            warn(
                Domain::Exec,
                "scheduled_skipped_paused",
                obj(&[("schedule_id", v_str(&job.schedule_id)), ("action", v_str(job.envelope.name()))]),
            );
            return None;
        }
        Some(self.execute_with_origin(&job.envelope, Origin::Scheduled).await)
    }

    /// Consumes monitor events and scheduler hand-offs until shutdown or until
    /// the monitor side closes.
    pub async fn run(
        &self,
        mut events: Subscription,
        mut executions: mpsc::UnboundedReceiver<ScheduledExecution>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut executions_open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event).await;
                    }
                    None => break,
                },
                job = executions.recv(), if executions_open => match job {
                    Some(job) => {
                        self.handle_scheduled(job).await;
                    }
                    None => executions_open = false,
                },
            }
        }
        info(Domain::Exec, "run_loop_exit", obj(&[]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MemoryTemplateStore;
    use crate::ledger::PaperLedger;
    use analytics::RecordingSink;
    use serde_json::{json, Map};

    fn recommendation(confidence: f64) -> MonitorEvent {
        let mut payload = Map::new();
        payload.insert("recommendedStrategies".to_string(), json!(["lending", "staking"]));
        payload.insert("confidence".to_string(), json!(format!("{:.8}", confidence)));
        payload.insert("transactionId".to_string(), json!("tx-rec"));
        MonitorEvent { kind: EventKind::StrategyRecommendation, payload }
    }

    fn orchestrator(ledger: Arc<PaperLedger>, policy: PolicyConfig) -> Orchestrator {
        let store = MemoryTemplateStore::new().with("rebalance.cdc", "transaction(a: String, b: String, c: UFix64, d: String) {}");
        Orchestrator::new(
            ledger,
            ActionBuilder::new(Arc::new(store), "0xf8d6e0586b0a20c7"),
            Scheduler::new(),
            Arc::new(RecordingSink::new()),
            policy,
        )
    }

    fn enabled() -> PolicyConfig {
        PolicyConfig { auto_execute: true, emergency_pause_threshold: 2, ..PolicyConfig::default() }
    }

    #[tokio::test]
    async fn test_recommendation_submits_half_the_vault() {
        let ledger = Arc::new(PaperLedger::new(1));
        ledger.set_vault_stats(VaultStats { total_assets: 100.0, total_shares: 100.0 });
        let orch = orchestrator(ledger.clone(), enabled());

        match orch.handle_event(&recommendation(85.0)).await {
            EventOutcome::Submitted(r) => assert!(r.success),
            other => panic!("unexpected outcome {:?}", other),
        }
        let subs = ledger.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].args()[1].value, json!("lending"));
        assert_eq!(subs[0].args()[2].value, json!("50.00000000"));
        assert_eq!(subs[0].args()[3].value, json!("AI Recommendation (confidence: 85%)"));
    }

    #[tokio::test]
    async fn test_failed_vault_stats_rebalances_nothing() {
        let ledger = Arc::new(PaperLedger::new(1));
        ledger.fail_vault_stats();
        let orch = orchestrator(ledger.clone(), enabled());
        match orch.handle_event(&recommendation(95.0)).await {
            EventOutcome::Submitted(r) => assert!(r.success),
            other => panic!("unexpected outcome {:?}", other),
        }
        let subs = ledger.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].args()[2].value, json!("0.00000000"));
    }

    #[tokio::test]
    async fn test_emergency_pause_and_manual_recovery() {
        let ledger = Arc::new(PaperLedger::new(1));
        ledger.set_vault_stats(VaultStats { total_assets: 10.0, total_shares: 10.0 });
        ledger.fail_submissions("relay unreachable");
        let orch = orchestrator(ledger.clone(), enabled());

        for _ in 0..2 {
            match orch.handle_event(&recommendation(90.0)).await {
                EventOutcome::Submitted(r) => {
                    assert!(!r.success);
                    assert_eq!(r.error.as_deref(), Some("relay unreachable"));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(orch.circuit_state(), CircuitState::Open);
        assert_eq!(
            orch.handle_event(&recommendation(90.0)).await,
            EventOutcome::Skipped("emergency_pause".to_string())
        );

        ledger.clear_submission_failure();
        let env = orch
            .builder()
            .rebalance(&RebalanceRequest {
                from_strategy: "current".to_string(),
                to_strategy: "lending".to_string(),
                amount: 1.0,
                reason: "manual".to_string(),
            })
            .unwrap();
        assert!(orch.execute_action(&env).await.success);
        assert_eq!(orch.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_listener_reports_closed_loop() {
        let (listener, rx) = execution_channel();
        drop(rx);
        let env = orchestrator(Arc::new(PaperLedger::new(1)), enabled())
            .builder()
            .rebalance(&RebalanceRequest {
                from_strategy: "a".to_string(),
                to_strategy: "b".to_string(),
                amount: 1.0,
                reason: "r".to_string(),
            })
            .unwrap();
        assert!(listener.on_execute("schedule_1", &env).is_err());
    }
}
